// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The service container.
//!
//! Protocol extensions plug into the client as services. A service
//! declares the services it depends on (`orders_after`) and the services
//! it must precede (`orders_before`); [`ServiceContainer::summon`]
//! instantiates a service together with its transitive dependency closure
//! in a topologically correct order. The ordering is fixed at summon
//! time, there is no runtime re-ordering; dependency cycles are rejected
//! when summoning.

use core::any::{type_name, Any, TypeId};
use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use strix_stanzas::jid::Jid;

use crate::error::Error;
use crate::stanzastream::{
    send_iq_inner, Hooks, IqRequest, IqRequestHandler, IqRequestKind, IqResponseToken,
    StanzaSender, StanzaToken, StreamFilters,
};
use crate::stanza::Stanza;

use super::ClientEvent;

/// Error produced while summoning services.
#[derive(Debug)]
pub enum ServiceError {
    /// The dependency graph contains a cycle.
    DependencyCycle(&'static str),

    /// Summoning the service would contradict an `orders_before`
    /// declaration of an already instantiated service.
    OrderViolation(&'static str),

    /// The service constructor failed.
    Attach(&'static str, Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DependencyCycle(name) => {
                write!(f, "service dependency cycle involving {}", name)
            }
            Self::OrderViolation(name) => {
                write!(f, "summoning {} violates a declared service order", name)
            }
            Self::Attach(name, e) => write!(f, "failed to attach {}: {}", name, e),
        }
    }
}

impl std::error::Error for ServiceError {}

/// The per-service view of the client: a sending handle plus the shared
/// stream hooks.
#[derive(Clone)]
pub struct ServiceHandle {
    pub(crate) sender: StanzaSender,
    pub(crate) hooks: Arc<Hooks>,
}

impl ServiceHandle {
    /// Send a stanza.
    pub async fn send(&self, stanza: Box<Stanza>) -> Result<StanzaToken, Error> {
        self.sender.send(stanza).await
    }

    /// Send an IQ request and obtain the response token.
    pub async fn send_iq(
        &self,
        to: Option<Jid>,
        req: IqRequest,
    ) -> Result<IqResponseToken, Error> {
        send_iq_inner(&self.hooks, &self.sender, to, req).await
    }

    /// Register an inbound IQ request handler.
    pub fn register_iq_handler(
        &self,
        kind: IqRequestKind,
        ns: &str,
        name: &str,
        handler: IqRequestHandler,
    ) -> Result<(), crate::stanzastream::HandlerAlreadyRegistered> {
        self.hooks
            .iq_handlers
            .lock()
            .unwrap()
            .register(kind, ns, name, handler)
    }

    /// Access the filter chains.
    pub fn with_filters<R>(&self, f: impl FnOnce(&mut StreamFilters) -> R) -> R {
        f(&mut self.hooks.filters.lock().unwrap())
    }

    /// Access the payload registry.
    pub fn with_registry<R>(
        &self,
        f: impl FnOnce(&mut strix_schema::PayloadRegistry) -> R,
    ) -> R {
        f(&mut self.hooks.registry.lock().unwrap())
    }

    /// Access the message dispatcher.
    pub fn with_message_dispatcher<R>(
        &self,
        f: impl FnOnce(&mut crate::stanzastream::MessageDispatcher) -> R,
    ) -> R {
        f(&mut self.hooks.messages.lock().unwrap())
    }

    /// Access the presence dispatcher.
    pub fn with_presence_dispatcher<R>(
        &self,
        f: impl FnOnce(&mut crate::stanzastream::PresenceDispatcher) -> R,
    ) -> R {
        f(&mut self.hooks.presences.lock().unwrap())
    }
}

/// Recipe for instantiating a service, with its declared ordering
/// relations.
pub struct ServiceDescriptor {
    type_id: TypeId,
    name: &'static str,
    dependencies: fn() -> Vec<ServiceDescriptor>,
    orders_before: fn() -> Vec<TypeId>,
    construct: fn(&ServiceHandle) -> Result<Box<dyn Service>, Error>,
}

impl ServiceDescriptor {
    /// The descriptor of service type `S`.
    pub fn of<S: Service>() -> ServiceDescriptor {
        ServiceDescriptor {
            type_id: TypeId::of::<S>(),
            name: type_name::<S>(),
            dependencies: S::orders_after,
            orders_before: S::orders_before,
            construct: |handle| Ok(Box::new(S::attach(handle)?)),
        }
    }
}

/// A pluggable protocol extension bound to exactly one client.
pub trait Service: Send + 'static {
    /// Services which must be instantiated (and receive events) before
    /// this one.
    fn orders_after() -> Vec<ServiceDescriptor>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Services this one must be instantiated before.
    ///
    /// Unlike `orders_after`, these are not instantiated automatically;
    /// the declaration is enforced as a constraint at summon time.
    fn orders_before() -> Vec<TypeId>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Construct the service.
    fn attach(handle: &ServiceHandle) -> Result<Self, Error>
    where
        Self: Sized;

    /// Observe a client lifecycle event.
    ///
    /// Delivery is synchronous from the client's event loop; handlers
    /// which need to block must move the work into a task.
    fn handle_event(&mut self, _event: &ClientEvent) {}

    /// Tear the service down; called in reverse summon order.
    fn shutdown(&mut self) {}

    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Container owning the service instances of one client.
pub struct ServiceContainer {
    handle: ServiceHandle,
    // summon order; torn down in reverse
    services: Vec<(TypeId, &'static str, Box<dyn Service>)>,
    index: HashMap<TypeId, usize>,
}

impl ServiceContainer {
    pub(super) fn new(handle: ServiceHandle) -> ServiceContainer {
        ServiceContainer {
            handle,
            services: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// The handle services are attached with.
    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Summon a service: return the existing instance or instantiate the
    /// class and its transitive dependency closure in topological order.
    pub fn summon<S: Service>(&mut self) -> Result<(), ServiceError> {
        let mut visiting = Vec::new();
        self.summon_desc(ServiceDescriptor::of::<S>(), &mut visiting)
    }

    fn summon_desc(
        &mut self,
        desc: ServiceDescriptor,
        visiting: &mut Vec<TypeId>,
    ) -> Result<(), ServiceError> {
        if self.index.contains_key(&desc.type_id) {
            return Ok(());
        }
        if visiting.contains(&desc.type_id) {
            return Err(ServiceError::DependencyCycle(desc.name));
        }
        visiting.push(desc.type_id);
        for dependency in (desc.dependencies)() {
            self.summon_desc(dependency, visiting)?;
        }
        visiting.pop();

        // a class listed in our orders_before set must not exist yet:
        // ordering is fixed at summon time
        for successor in (desc.orders_before)() {
            if self.index.contains_key(&successor) {
                return Err(ServiceError::OrderViolation(desc.name));
            }
        }

        let service = (desc.construct)(&self.handle)
            .map_err(|e| ServiceError::Attach(desc.name, e))?;
        self.index.insert(desc.type_id, self.services.len());
        self.services.push((desc.type_id, desc.name, service));
        log::debug!("summoned service {}", desc.name);
        Ok(())
    }

    /// Whether a service is instantiated.
    pub fn has<S: Service>(&self) -> bool {
        self.index.contains_key(&TypeId::of::<S>())
    }

    /// Run a closure against a summoned service instance.
    pub fn with_service<S: Service, R>(&mut self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let index = *self.index.get(&TypeId::of::<S>())?;
        let (_, _, service) = &mut self.services[index];
        service.as_any_mut().downcast_mut::<S>().map(f)
    }

    /// Deliver an event to all services, in summon order.
    pub fn dispatch(&mut self, event: &ClientEvent) {
        for (_, _, service) in self.services.iter_mut() {
            service.handle_event(event);
        }
    }

    /// Shut all services down, in reverse summon order.
    pub fn shutdown_all(&mut self) {
        for (_, name, service) in self.services.iter_mut().rev() {
            log::debug!("shutting down service {}", name);
            service.shutdown();
        }
        self.services.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    static ATTACH_LOG: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());
    static SHUTDOWN_LOG: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

    fn test_handle() -> ServiceHandle {
        // a stream whose worker immediately fails is good enough for
        // container tests: nothing here performs I/O
        let stream = crate::stanzastream::StanzaStream::new(
            Box::new(|_, slot| drop(slot)),
            4,
            None,
            strix_schema::PayloadRegistry::new(),
        );
        ServiceHandle {
            sender: stream.sender(),
            hooks: stream.hooks().clone(),
        }
    }

    struct Base;

    impl Service for Base {
        fn attach(_handle: &ServiceHandle) -> Result<Self, Error> {
            ATTACH_LOG.lock().unwrap().push("base");
            Ok(Base)
        }

        fn shutdown(&mut self) {
            SHUTDOWN_LOG.lock().unwrap().push("base");
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Dependent {
        events: AtomicUsize,
    }

    impl Service for Dependent {
        fn orders_after() -> Vec<ServiceDescriptor> {
            vec![ServiceDescriptor::of::<Base>()]
        }

        fn attach(_handle: &ServiceHandle) -> Result<Self, Error> {
            ATTACH_LOG.lock().unwrap().push("dependent");
            Ok(Dependent {
                events: AtomicUsize::new(0),
            })
        }

        fn handle_event(&mut self, _event: &ClientEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&mut self) {
            SHUTDOWN_LOG.lock().unwrap().push("dependent");
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct CycleA;
    struct CycleB;

    impl Service for CycleA {
        fn orders_after() -> Vec<ServiceDescriptor> {
            vec![ServiceDescriptor::of::<CycleB>()]
        }

        fn attach(_handle: &ServiceHandle) -> Result<Self, Error> {
            Ok(CycleA)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Service for CycleB {
        fn orders_after() -> Vec<ServiceDescriptor> {
            vec![ServiceDescriptor::of::<CycleA>()]
        }

        fn attach(_handle: &ServiceHandle) -> Result<Self, Error> {
            Ok(CycleB)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn summon_instantiates_dependencies_in_order() {
        ATTACH_LOG.lock().unwrap().clear();
        SHUTDOWN_LOG.lock().unwrap().clear();
        let mut container = ServiceContainer::new(test_handle());
        container.summon::<Dependent>().unwrap();
        assert_eq!(*ATTACH_LOG.lock().unwrap(), vec!["base", "dependent"]);
        assert!(container.has::<Base>());

        // idempotent
        container.summon::<Dependent>().unwrap();
        assert_eq!(ATTACH_LOG.lock().unwrap().len(), 2);

        container.shutdown_all();
        assert_eq!(*SHUTDOWN_LOG.lock().unwrap(), vec!["dependent", "base"]);
    }

    #[tokio::test]
    async fn cycles_are_detected() {
        let mut container = ServiceContainer::new(test_handle());
        match container.summon::<CycleA>() {
            Err(ServiceError::DependencyCycle(_)) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    struct Counting {
        events: AtomicUsize,
    }

    impl Service for Counting {
        fn attach(_handle: &ServiceHandle) -> Result<Self, Error> {
            Ok(Counting {
                events: AtomicUsize::new(0),
            })
        }

        fn handle_event(&mut self, _event: &ClientEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn events_reach_services() {
        let mut container = ServiceContainer::new(test_handle());
        container.summon::<Counting>().unwrap();
        container.dispatch(&ClientEvent::Stopped);
        let count = container
            .with_service::<Counting, _>(|service| service.events.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(count, 1);
    }
}
