//! Extension points of the broker.
//!
//! Handlers are registered per [`Type`] with a priority and run synchronously on the
//! calling task, highest priority first. Each one sees the result accumulated so far
//! and returns whether the chain should proceed. No broker, session or handler map
//! lock is held while a handler runs, so a handler may call back into the broker or
//! register and remove handlers; such changes apply from the next execution on.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::session::Session;
use crate::types::{ClientId, Publish, SubscribeReturnCode, TopicFilter};
use crate::{QoS, Reason, Result};

pub type Priority = u32;
pub type Proceed = bool;
pub type ReturnType = (Proceed, Option<HookResult>);
pub type HandlerId = String;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Type {
    SessionCreated,
    SessionTerminated,
    SessionSubscribed,
    SessionUnsubscribed,

    ClientConnected,
    ClientDisconnected,
    ClientSubscribe,

    MessagePublish,
    MessageAcked,
    MessageDropped,
}

#[derive(Debug, Clone)]
pub enum Parameter<'a> {
    SessionCreated(&'a Session),
    SessionTerminated(&'a Session, Reason),
    SessionSubscribed(&'a Session, &'a TopicFilter, QoS),
    SessionUnsubscribed(&'a Session, &'a TopicFilter),

    ClientConnected(&'a Session),
    ClientDisconnected(&'a Session, Reason),
    ///Requested filter and QoS, before the registry is touched
    ClientSubscribe(&'a Session, &'a TopicFilter, QoS),

    MessagePublish(&'a Session, &'a Publish),
    ///Subscriber and the delivery it completed
    MessageAcked(&'a Session, &'a Publish),
    ///Target client, dropped delivery, cause
    MessageDropped(&'a ClientId, &'a Publish, Reason),
}

impl Parameter<'_> {
    #[inline]
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::SessionCreated(..) => Type::SessionCreated,
            Parameter::SessionTerminated(..) => Type::SessionTerminated,
            Parameter::SessionSubscribed(..) => Type::SessionSubscribed,
            Parameter::SessionUnsubscribed(..) => Type::SessionUnsubscribed,
            Parameter::ClientConnected(..) => Type::ClientConnected,
            Parameter::ClientDisconnected(..) => Type::ClientDisconnected,
            Parameter::ClientSubscribe(..) => Type::ClientSubscribe,
            Parameter::MessagePublish(..) => Type::MessagePublish,
            Parameter::MessageAcked(..) => Type::MessageAcked,
            Parameter::MessageDropped(..) => Type::MessageDropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    ///Granted QoS or failure, for ClientSubscribe
    SubscribeAck(SubscribeReturnCode),
    ///Rewritten message, for MessagePublish
    Publish(Publish),
    ///Vetoed, for MessagePublish
    PublishRefused,
}

pub trait Handler: Sync + Send {
    fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType;
}

/// Adapts a closure to [`Handler`].
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Parameter, Option<HookResult>) -> ReturnType + Sync + Send,
{
    #[inline]
    fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        (self.0)(param, acc)
    }
}

type HandlerMap = BTreeMap<(Priority, HandlerId), Arc<dyn Handler>>;

#[derive(Clone, Default)]
pub struct DefaultHookManager {
    handlers: Arc<DashMap<Type, Arc<RwLock<HandlerMap>>>>,
}

impl DefaultHookManager {
    #[inline]
    pub fn new() -> DefaultHookManager {
        Self::default()
    }

    pub fn add(&self, typ: Type, priority: Priority, handler: Box<dyn Handler>) -> Result<HandlerId> {
        let id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string();
        let type_handlers = self.handlers.entry(typ).or_default().value().clone();
        let mut type_handlers = type_handlers.write();
        let key = (priority, id.clone());
        if type_handlers.contains_key(&key) {
            Err(anyhow!(format!("handler id is repetition, key is {:?}, type is {:?}", key, typ)))
        } else {
            type_handlers.insert(key, Arc::from(handler));
            Ok(id)
        }
    }

    #[inline]
    pub fn add_fn<F>(&self, typ: Type, priority: Priority, f: F) -> Result<HandlerId>
    where
        F: Fn(&Parameter, Option<HookResult>) -> ReturnType + Sync + Send + 'static,
    {
        self.add(typ, priority, Box::new(FnHandler(f)))
    }

    pub fn remove(&self, typ: Type, id: &str) -> bool {
        let type_handlers = self.handlers.get(&typ).map(|h| h.value().clone());
        match type_handlers {
            Some(type_handlers) => {
                let mut type_handlers = type_handlers.write();
                let before = type_handlers.len();
                type_handlers.retain(|(_, hid), _| hid != id);
                before != type_handlers.len()
            }
            None => false,
        }
    }

    /// Installs the subscribe policy: `f` decides, per filter, the QoS granted or a
    /// failure. The registry is left untouched for a failed filter.
    pub fn subscribe_policy<F>(&self, f: F) -> Result<HandlerId>
    where
        F: Fn(&Session, &TopicFilter, QoS) -> SubscribeReturnCode + Sync + Send + 'static,
    {
        self.add_fn(Type::ClientSubscribe, 0, move |param, acc| match param {
            Parameter::ClientSubscribe(s, topic_filter, qos) => {
                (true, Some(HookResult::SubscribeAck(f(s, topic_filter, *qos))))
            }
            _ => (true, acc),
        })
    }

    pub fn exec(&self, p: Parameter) -> Option<HookResult> {
        let mut acc = None;
        let type_handlers = { self.handlers.get(&p.get_type()).map(|h| h.value().clone()) };
        if let Some(type_handlers) = type_handlers {
            let handlers = type_handlers.read().values().rev().cloned().collect::<Vec<_>>();
            for handler in handlers {
                let (proceed, new_acc) = handler.hook(&p, acc);
                if !proceed {
                    return new_acc;
                }
                acc = new_acc;
            }
        }
        acc
    }

    #[inline]
    pub fn session_created(&self, s: &Session) {
        self.exec(Parameter::SessionCreated(s));
    }

    #[inline]
    pub fn session_terminated(&self, s: &Session, r: Reason) {
        self.exec(Parameter::SessionTerminated(s, r));
    }

    #[inline]
    pub fn session_subscribed(&self, s: &Session, topic_filter: &TopicFilter, qos: QoS) {
        self.exec(Parameter::SessionSubscribed(s, topic_filter, qos));
    }

    #[inline]
    pub fn session_unsubscribed(&self, s: &Session, topic_filter: &TopicFilter) {
        self.exec(Parameter::SessionUnsubscribed(s, topic_filter));
    }

    #[inline]
    pub fn client_connected(&self, s: &Session) {
        self.exec(Parameter::ClientConnected(s));
    }

    #[inline]
    pub fn client_disconnected(&self, s: &Session, r: Reason) {
        self.exec(Parameter::ClientDisconnected(s, r));
    }

    ///Granted QoS for one requested filter, the requested QoS when no policy decides.
    #[inline]
    pub fn client_subscribe(&self, s: &Session, topic_filter: &TopicFilter, qos: QoS) -> SubscribeReturnCode {
        match self.exec(Parameter::ClientSubscribe(s, topic_filter, qos)) {
            Some(HookResult::SubscribeAck(code)) => code,
            _ => SubscribeReturnCode::Success(qos),
        }
    }

    ///`Ok(Some(_))` replaces the message, `Err(Reason::PublishRefused)` vetoes it.
    #[inline]
    pub fn message_publish(&self, s: &Session, publish: &Publish) -> std::result::Result<Option<Publish>, Reason> {
        match self.exec(Parameter::MessagePublish(s, publish)) {
            Some(HookResult::Publish(p)) => Ok(Some(p)),
            Some(HookResult::PublishRefused) => Err(Reason::PublishRefused),
            _ => Ok(None),
        }
    }

    #[inline]
    pub fn message_acked(&self, s: &Session, publish: &Publish) {
        self.exec(Parameter::MessageAcked(s, publish));
    }

    #[inline]
    pub fn message_dropped(&self, to: &ClientId, publish: &Publish, r: Reason) {
        log::debug!("{:?} message dropped, {:?}, reason: {}", to, publish, r);
        self.exec(Parameter::MessageDropped(to, publish, r));
    }
}

impl std::fmt::Debug for DefaultHookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DefaultHookManager {{ types: {} }}", self.handlers.len())
    }
}
