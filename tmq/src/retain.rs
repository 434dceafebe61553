use parking_lot::RwLock;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, Publish, TopicName};
use crate::utils::Counter;
use crate::Result;

/// Storage of retained messages, at most one per topic name.
pub trait RetainStorage: Sync + Send {
    ///Whether retained messages are kept at all
    fn enable(&self) -> bool;

    ///Stores `publish` as the retained message of `topic`; an empty payload deletes it.
    fn set(&self, topic: &TopicName, publish: Publish) -> Result<()>;

    ///Retained messages whose topic name matches `topic_filter`.
    fn get(&self, topic_filter: &Topic) -> Result<Vec<(TopicName, Publish)>>;

    fn count(&self) -> isize;

    fn max(&self) -> isize;
}

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: std::fmt::Debug + Clone,
{
    ///Returns the value previously stored under `topic`.
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        self._insert(topic.levels(), value)
    }

    #[inline]
    fn _insert(&mut self, path: &[Level], value: V) -> Option<V> {
        if let Some((first, rest)) = path.split_first() {
            self.branches.entry(first.clone()).or_default()._insert(rest, value)
        } else {
            self.value.replace(value)
        }
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels())
    }

    #[inline]
    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        match path.split_first() {
            None => self.value.take(),
            Some((first, rest)) => {
                let x = self.branches.get_mut(first)?;
                let res = x._remove(rest);
                if x.value.is_none() && x.branches.is_empty() {
                    self.branches.remove(first);
                }
                res
            }
        }
    }

    #[inline]
    pub fn matches(&self, topic_filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        self._matches(topic_filter.levels(), Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Level], sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        let Some((first, rest)) = path.split_first() else {
            //Precise matching
            if let Some(v) = self.value.as_ref() {
                out.push((Topic::from(sub_path), v.clone()));
            }
            return;
        };

        match first {
            Level::SingleWildcard | Level::MultiWildcard => {
                //# Match parent, `a/#` also matches `a`
                if matches!(first, Level::MultiWildcard) && !sub_path.is_empty() {
                    if let Some(v) = self.value.as_ref() {
                        out.push((Topic::from(sub_path.clone()), v.clone()));
                    }
                }
                for (k, n) in self.branches.iter() {
                    //TopicName names starting with the $character cannot be matched with topic
                    //filters starting with wildcards (# or +)
                    if sub_path.is_empty() && k.is_metadata() {
                        continue;
                    }
                    let mut sub_path = sub_path.clone();
                    sub_path.push(k.clone());
                    if matches!(first, Level::MultiWildcard) {
                        n._matches_all(sub_path, out);
                    } else {
                        n._matches(rest, sub_path, out);
                    }
                }
            }
            _ => {
                if let Some(n) = self.branches.get(first) {
                    let mut sub_path = sub_path;
                    sub_path.push(first.clone());
                    n._matches(rest, sub_path, out);
                }
            }
        }
    }

    fn _matches_all(&self, sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        if let Some(v) = self.value.as_ref() {
            out.push((Topic::from(sub_path.clone()), v.clone()));
        }
        for (k, n) in self.branches.iter() {
            let mut sub_path = sub_path.clone();
            sub_path.push(k.clone());
            n._matches_all(sub_path, out);
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

/// In-memory [`RetainStorage`] over a [`RetainTree`].
pub struct DefaultRetainStorage {
    enable: bool,
    messages: RwLock<RetainTree<Publish>>,
    retaineds: Counter,
}

impl Default for DefaultRetainStorage {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DefaultRetainStorage {
    #[inline]
    pub fn new(enable: bool) -> Self {
        Self { enable, messages: RwLock::new(RetainTree::default()), retaineds: Counter::new() }
    }
}

impl RetainStorage for DefaultRetainStorage {
    #[inline]
    fn enable(&self) -> bool {
        self.enable
    }

    fn set(&self, topic: &TopicName, publish: Publish) -> Result<()> {
        let topic = Topic::name(topic)?;
        let mut messages = self.messages.write();
        if publish.payload.is_empty() {
            if messages.remove(&topic).is_some() {
                self.retaineds.dec();
            }
        } else if messages.insert(&topic, publish).is_none() {
            self.retaineds.inc();
        }
        log::debug!("retain set {}, count: {}", topic, self.retaineds.count());
        Ok(())
    }

    fn get(&self, topic_filter: &Topic) -> Result<Vec<(TopicName, Publish)>> {
        let matched = self.messages.read().matches(topic_filter);
        Ok(matched.into_iter().map(|(t, p)| (TopicName::from(t.to_string()), p)).collect())
    }

    #[inline]
    fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    fn max(&self) -> isize {
        self.retaineds.max()
    }
}
