//! Subscription registry.
//!
//! Topic filters are kept in a level trie; every node holds the subscribers whose
//! filter ends there, keyed by client id. Matching a topic name walks exact,
//! `+` and `#` branches at once, so cost follows the depth of the name, not the
//! number of filters.
//!
//! - A filter ending in `#` also matches its parent level (`a/#` matches `a`).
//! - Names whose first level starts with `$` are not matched by a filter whose
//!   first level is a wildcard.
//! - A client subscribed through several overlapping filters is reported once,
//!   with the highest QoS granted among them.

use std::collections::hash_map::Entry;

use itertools::Itertools;
use parking_lot::RwLock;

use crate::topic::{Level, Topic};
use crate::types::{ClientId, HashMap};
use crate::utils::Counter;
use crate::{MqttError, QoS};

pub type TopicTree = Node;

#[derive(Default)]
pub struct Node {
    subscribers: HashMap<ClientId, QoS>,
    branches: HashMap<Level, Node>,
}

impl Node {
    #[inline]
    fn insert(&mut self, path: &[Level], client_id: ClientId, qos: QoS) -> Option<QoS> {
        if let Some((first, rest)) = path.split_first() {
            self.branches.entry(first.clone()).or_default().insert(rest, client_id, qos)
        } else {
            self.subscribers.insert(client_id, qos)
        }
    }

    ///Returns the removed QoS and whether the filter lost its last subscriber.
    #[inline]
    fn remove(&mut self, path: &[Level], client_id: &ClientId) -> Option<(QoS, bool)> {
        match path.split_first() {
            None => {
                let qos = self.subscribers.remove(client_id)?;
                Some((qos, self.subscribers.is_empty()))
            }
            Some((first, rest)) => {
                let child = self.branches.get_mut(first)?;
                let res = child.remove(rest, client_id);
                if child.is_empty() {
                    self.branches.remove(first);
                }
                res
            }
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.branches.is_empty()
    }

    fn matches(&self, path: &[Level], root: bool, out: &mut HashMap<ClientId, QoS>) {
        let add_to_out = |subscribers: &HashMap<ClientId, QoS>, out: &mut HashMap<ClientId, QoS>| {
            for (client_id, qos) in subscribers {
                match out.entry(client_id.clone()) {
                    Entry::Occupied(mut e) => {
                        if *qos > *e.get() {
                            e.insert(*qos);
                        }
                    }
                    Entry::Vacant(e) => {
                        e.insert(*qos);
                    }
                }
            }
        };

        let Some((first, rest)) = path.split_first() else {
            //Match parent #
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                add_to_out(&n.subscribers, out);
            }
            add_to_out(&self.subscribers, out);
            return;
        };

        //Topic names starting with the $ character cannot be matched with topic
        //filters starting with wildcards (# or +)
        if !(root && first.is_metadata()) {
            //Multilayer matching
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                add_to_out(&n.subscribers, out);
            }
            //Single layer matching
            if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                n.matches(rest, false, out);
            }
        }

        //Precise matching
        if let Some(n) = self.branches.get(first) {
            n.matches(rest, false, out);
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.subscribers.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    fn list(&self, out: &mut Vec<String>, top: usize, depth: usize) {
        if top == 0 {
            return;
        }
        for (l, n) in self.branches.iter().sorted_by(|(a, _), (b, _)| a.cmp(b)) {
            out.push(format!("{} {:?}, subscribers: {}", " ".repeat(depth * 3), l.to_string(), n.subscribers.len()));
            n.list(out, top - 1, depth + 1);
        }
    }
}

/// Topic filter -> subscriber index shared by every session.
#[derive(Default)]
pub struct Registry {
    tree: RwLock<TopicTree>,
    ///Distinct topic filters with at least one subscriber
    topics: Counter,
    ///(client, filter) relations
    routes: Counter,
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the subscription of `client_id` to `topic_filter`.
    /// Returns the QoS previously granted on the same filter.
    pub fn subscribe(&self, client_id: &ClientId, topic_filter: &str, qos: QoS) -> Result<Option<QoS>, MqttError> {
        let topic = Topic::filter(topic_filter)?;
        let mut tree = self.tree.write();
        let prev = tree.insert(topic.levels(), client_id.clone(), qos);
        if prev.is_none() {
            self.routes.inc();
            if Self::filter_size(&tree, &topic) == 1 {
                self.topics.inc();
            }
        }
        log::debug!("{:?} subscribe {} {:?}, prev: {:?}", client_id, topic_filter, qos, prev);
        Ok(prev)
    }

    /// Removes one subscription relation, returns false when it did not exist.
    pub fn unsubscribe(&self, client_id: &ClientId, topic_filter: &str) -> bool {
        let Ok(topic) = Topic::filter(topic_filter) else {
            return false;
        };
        match self.tree.write().remove(topic.levels(), client_id) {
            Some((_, last)) => {
                self.routes.dec();
                if last {
                    self.topics.dec();
                }
                true
            }
            None => false,
        }
    }

    /// Subscribers whose filters match the concrete topic name, one entry per
    /// client carrying the highest granted QoS.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> Vec<(ClientId, QoS)> {
        let mut out = HashMap::default();
        self.tree.read().matches(topic.levels(), true, &mut out);
        out.into_iter().collect()
    }

    #[inline]
    pub fn topics(&self) -> &Counter {
        &self.topics
    }

    #[inline]
    pub fn routes(&self) -> &Counter {
        &self.routes
    }

    ///Debug listing of the first `top` levels of the trie.
    #[inline]
    pub fn list(&self, top: usize) -> Vec<String> {
        let mut out = Vec::new();
        self.tree.read().list(&mut out, top, 0);
        out
    }

    #[inline]
    fn filter_size(tree: &TopicTree, topic: &Topic) -> usize {
        let mut node = tree;
        for l in topic.levels() {
            match node.branches.get(l) {
                Some(n) => node = n,
                None => return 0,
            }
        }
        node.subscribers.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.read();
        write!(f, "Registry {{ nodes_size: {}, values_size: {} }}", tree.nodes_size(), tree.values_size())
    }
}
