// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! This module owns the broker connection lifecycle. A [`ConnectionManager`]
//! collects the queue definitions, and once started it drives the setup sequence
//! on a background task:
//!
//! 1. connect to the broker
//! 2. open one channel
//! 3. declare the topic exchange
//! 4. declare every queue and bind each one as soon as its own declare is acknowledged
//!
//! Every transport call runs on its own task and reports back as an [`Event`].
//! The events are consumed by a single loop, so state transitions never overlap.
//! When the connection is lost before [`ManagerHandle::close`] was called, the
//! loop resets its counters, waits the configured retry delay and starts over.

use crate::{
    configs::ConnectionParameters,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{AmqpChannel, AmqpConnection, AmqpTransport, CloseNotifier},
};
use std::{future::Future, ops::ControlFlow, sync::Arc};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Stages of the connection setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    ChannelOpening,
    ExchangeDeclaring,
    QueuesDeclaring,
    Ready,
    /// Waiting for the retry delay after a lost connection.
    Reconnecting,
    Closed,
}

/// Snapshot of the manager published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Queue declarations acknowledged in the current setup pass.
    pub declared_queues: usize,
    /// Queue bindings acknowledged in the current setup pass.
    pub bound_queues: usize,
    pub connect_attempts: u64,
    /// Most recent setup failure, kept across reconnects.
    pub last_error: Option<AmqpError>,
}

/// Inputs of the state machine.
///
/// Every event raised by a transport call carries the cycle it belongs to. The
/// cycle is bumped whenever a connection is lost, which turns any straggler from
/// the old connection into a no-op.
pub(crate) enum Event {
    ConnectionOpened {
        cycle: u64,
        connection: Arc<dyn AmqpConnection>,
    },
    ChannelOpened {
        cycle: u64,
        channel: Arc<dyn AmqpChannel>,
    },
    ExchangeDeclared {
        cycle: u64,
    },
    QueueDeclared {
        cycle: u64,
        queue: usize,
    },
    QueueBound {
        cycle: u64,
        queue: usize,
    },
    StageFailed {
        cycle: u64,
        error: AmqpError,
    },
    ConnectionClosed {
        cycle: u64,
        reason: String,
    },
    RetryElapsed {
        cycle: u64,
    },
    CloseRequested,
}

impl Event {
    fn cycle(&self) -> Option<u64> {
        match self {
            Event::ConnectionOpened { cycle, .. }
            | Event::ChannelOpened { cycle, .. }
            | Event::ExchangeDeclared { cycle }
            | Event::QueueDeclared { cycle, .. }
            | Event::QueueBound { cycle, .. }
            | Event::StageFailed { cycle, .. }
            | Event::ConnectionClosed { cycle, .. }
            | Event::RetryElapsed { cycle } => Some(*cycle),
            Event::CloseRequested => None,
        }
    }
}

/// Declares a topic exchange and a fixed set of queues on one connection,
/// and keeps them declared across reconnects.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rabbitmq_connection::errors::AmqpError> {
/// use rabbitmq_connection::{
///     channel::LapinTransport, configs::ConnectionParameters,
///     manager::ConnectionManager, queue::QueueDefinition,
/// };
/// use std::sync::Arc;
///
/// let transport = Arc::new(LapinTransport::new());
/// let handle = ConnectionManager::new(ConnectionParameters::default(), transport)
///     .add_queue_definition(QueueDefinition::new("test", "test.route"))
///     .start();
///
/// handle.wait_ready().await?;
/// handle.close().await
/// # }
/// ```
pub struct ConnectionManager {
    parameters: ConnectionParameters,
    transport: Arc<dyn AmqpTransport>,
    queues: Vec<QueueDefinition>,
}

impl ConnectionManager {
    pub fn new(
        parameters: ConnectionParameters,
        transport: Arc<dyn AmqpTransport>,
    ) -> ConnectionManager {
        debug!(host = parameters.host_name(), "creating connection manager");
        ConnectionManager {
            parameters,
            transport,
            queues: vec![],
        }
    }

    /// Adds a queue to declare and bind on every setup pass.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn add_queue_definition(mut self, def: QueueDefinition) -> Self {
        debug!(queue = def.name(), "adding queue definition");
        self.queues.push(def);
        self
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Spawns the connection loop on the current tokio runtime.
    ///
    /// The first connect attempt is issued right away. The loop keeps the
    /// topology declared, reconnecting forever, until [`ManagerHandle::close`]
    /// is called. Dropping the handle does not stop it.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn start(self) -> ManagerHandle {
        let (events, receiver) = mpsc::unbounded_channel();
        let (status, status_receiver) = watch::channel(ConnectionStatus::default());

        let session = Session {
            exchange: ExchangeDefinition::topic(self.parameters.exchange_name()),
            parameters: Arc::new(self.parameters),
            transport: self.transport,
            queues: self.queues,
            state: ConnectionState::Idle,
            connection: None,
            channel: None,
            closing: false,
            tearing_down: false,
            declared_count: 0,
            bound_count: 0,
            cycle: 0,
            retry_timer: None,
            events: events.clone(),
            status,
        };

        ManagerHandle {
            events,
            status: status_receiver,
            task: tokio::spawn(session.run(receiver)),
        }
    }
}

/// Handle to a started [`ConnectionManager`].
pub struct ManagerHandle {
    events: UnboundedSender<Event>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl ManagerHandle {
    /// Subscribes to status updates.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Returns the latest published status.
    pub fn current(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Waits until every queue is declared and bound.
    ///
    /// # Returns
    /// Ok(()) once ready, or `AmqpError::ManagerClosed` if the manager shuts down first
    pub async fn wait_ready(&self) -> Result<(), AmqpError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| matches!(s.state, ConnectionState::Ready | ConnectionState::Closed))
            .await
            .map_err(|_| AmqpError::ManagerClosed)?
            .state;

        match reached {
            ConnectionState::Ready => Ok(()),
            _ => Err(AmqpError::ManagerClosed),
        }
    }

    /// Shuts the manager down and waits for the loop to stop.
    ///
    /// A pending reconnect is cancelled and the live connection, if any, is
    /// closed. No connect attempt is made afterwards.
    pub async fn close(self) -> Result<(), AmqpError> {
        // the loop may have stopped already
        let _ = self.events.send(Event::CloseRequested);

        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "connection loop terminated abnormally");
            AmqpError::InternalError
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// State owned by the connection loop.
struct Session {
    parameters: Arc<ConnectionParameters>,
    transport: Arc<dyn AmqpTransport>,
    exchange: ExchangeDefinition,
    queues: Vec<QueueDefinition>,
    state: ConnectionState,
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    closing: bool,
    /// A failed setup pass is waiting for its connection to finish closing.
    tearing_down: bool,
    declared_count: usize,
    bound_count: usize,
    cycle: u64,
    retry_timer: Option<JoinHandle<()>>,
    events: UnboundedSender<Event>,
    status: watch::Sender<ConnectionStatus>,
}

impl Session {
    async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        self.connect();

        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }

        debug!("connection loop stopped");
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        if let Some(cycle) = event.cycle() {
            if cycle != self.cycle {
                debug!(cycle, current = self.cycle, "discarding stale connection event");
                return ControlFlow::Continue(());
            }
        }

        match event {
            Event::CloseRequested => return self.on_close_requested(),
            Event::ConnectionClosed { reason, .. } => return self.on_connection_closed(&reason),
            Event::StageFailed { error, .. } => return self.on_stage_failed(error),
            Event::RetryElapsed { .. } => self.on_retry_elapsed(),
            Event::ConnectionOpened { connection, .. } => self.on_connection_opened(connection),
            _ if self.closing || self.tearing_down => {
                debug!("connection is closing, ignoring setup progress")
            }
            Event::ChannelOpened { channel, .. } => self.on_channel_opened(channel),
            Event::ExchangeDeclared { .. } => self.on_exchange_declared(),
            Event::QueueDeclared { queue, .. } => self.on_queue_declared(queue),
            Event::QueueBound { queue, .. } => self.on_queue_bound(queue),
        }

        ControlFlow::Continue(())
    }

    fn connect(&mut self) {
        self.transition(ConnectionState::Connecting);
        self.status.send_modify(|s| s.connect_attempts += 1);
        info!(host = self.parameters.host_name(), "connecting to broker");

        let transport = self.transport.clone();
        let parameters = self.parameters.clone();
        let cycle = self.cycle;
        let on_close = CloseNotifier::new(cycle, self.events.clone());

        self.spawn_stage(async move {
            match transport.connect(&parameters, on_close).await {
                Ok(connection) => Event::ConnectionOpened { cycle, connection },
                Err(error) => Event::StageFailed { cycle, error },
            }
        });
    }

    fn on_connection_opened(&mut self, connection: Arc<dyn AmqpConnection>) {
        debug!("connection successfully opened");
        self.connection = Some(connection.clone());

        if self.closing {
            self.close_connection(connection);
            return;
        }

        self.transition(ConnectionState::ChannelOpening);
        debug!("opening channel");

        let cycle = self.cycle;
        self.spawn_stage(async move {
            match connection.open_channel().await {
                Ok(channel) => Event::ChannelOpened { cycle, channel },
                Err(error) => Event::StageFailed { cycle, error },
            }
        });
    }

    fn on_channel_opened(&mut self, channel: Arc<dyn AmqpChannel>) {
        debug!("channel opened successfully");
        self.channel = Some(channel.clone());
        self.transition(ConnectionState::ExchangeDeclaring);
        debug!(exchange = self.exchange.name(), "declaring exchange");

        let exchange = self.exchange.clone();
        let cycle = self.cycle;
        self.spawn_stage(async move {
            match channel.declare_exchange(&exchange).await {
                Ok(()) => Event::ExchangeDeclared { cycle },
                Err(error) => Event::StageFailed { cycle, error },
            }
        });
    }

    fn on_exchange_declared(&mut self) {
        debug!(exchange = self.exchange.name(), "exchange declared successfully");
        self.transition(ConnectionState::QueuesDeclaring);

        if self.queues.is_empty() {
            self.ready();
            return;
        }

        let Some(channel) = self.current_channel() else {
            return;
        };

        debug!("declaring {} queues", self.queues.len());
        for (queue, def) in self.queues.iter().enumerate() {
            debug!(
                queue = def.name(),
                routing_key = def.routing_key(),
                "declaring queue"
            );

            let channel = channel.clone();
            let def = def.clone();
            let cycle = self.cycle;
            self.spawn_stage(async move {
                match channel.declare_queue(&def).await {
                    Ok(()) => Event::QueueDeclared { cycle, queue },
                    Err(error) => Event::StageFailed { cycle, error },
                }
            });
        }
    }

    fn on_queue_declared(&mut self, queue: usize) {
        let Some(channel) = self.current_channel() else {
            return;
        };

        self.declared_count += 1;
        self.publish_counts();

        let def = self.queues[queue].clone();
        debug!(queue = def.name(), "queue declared successfully");
        debug!(
            queue = def.name(),
            routing_key = def.routing_key(),
            "binding queue to routing key"
        );

        let exchange = self.exchange.name().to_owned();
        let cycle = self.cycle;
        self.spawn_stage(async move {
            match channel.bind_queue(&def, &exchange).await {
                Ok(()) => Event::QueueBound { cycle, queue },
                Err(error) => Event::StageFailed { cycle, error },
            }
        });
    }

    fn on_queue_bound(&mut self, queue: usize) {
        self.bound_count += 1;
        self.publish_counts();

        let def = &self.queues[queue];
        debug!(
            queue = def.name(),
            routing_key = def.routing_key(),
            "queue bound to routing key successfully"
        );

        if self.bound_count == self.queues.len() {
            self.ready();
        }
    }

    fn ready(&mut self) {
        info!(
            exchange = self.exchange.name(),
            queues = self.queues.len(),
            "topology declared"
        );
        self.transition(ConnectionState::Ready);
    }

    fn on_stage_failed(&mut self, error: AmqpError) -> ControlFlow<()> {
        error!(
            error = error.to_string(),
            stage = error.stage(),
            "connection setup failed"
        );
        self.status.send_modify(|s| s.last_error = Some(error));

        // a rejected declare leaves the connection open; the pass ends once it is closed
        match self.connection.clone() {
            Some(connection) if !self.closing && !self.tearing_down => {
                self.tearing_down = true;
                self.close_connection(connection);
                ControlFlow::Continue(())
            }
            Some(_) => ControlFlow::Continue(()),
            None => self.connection_lost(),
        }
    }

    fn on_connection_closed(&mut self, reason: &str) -> ControlFlow<()> {
        info!(reason, "connection closed");
        self.connection_lost()
    }

    fn on_close_requested(&mut self) -> ControlFlow<()> {
        info!("closing connection manager");
        self.closing = true;

        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }

        match self.connection.clone() {
            // already being closed after a failed setup step
            Some(_) if self.tearing_down => ControlFlow::Continue(()),
            Some(connection) => {
                self.close_connection(connection);
                ControlFlow::Continue(())
            }
            // the pending connect will be closed as soon as it resolves
            None if self.state == ConnectionState::Connecting => ControlFlow::Continue(()),
            None => self.stop(),
        }
    }

    fn on_retry_elapsed(&mut self) {
        self.retry_timer = None;

        if self.closing {
            return;
        }

        self.connect();
    }

    /// Resets the pass and either stops or schedules the next attempt.
    fn connection_lost(&mut self) -> ControlFlow<()> {
        self.channel = None;
        self.connection = None;
        self.tearing_down = false;
        self.declared_count = 0;
        self.bound_count = 0;
        self.cycle += 1;
        self.publish_counts();

        if self.closing {
            return self.stop();
        }

        let delay = self.parameters.retry_delay_duration();
        info!("reconnecting in {:?}", delay);
        self.transition(ConnectionState::Reconnecting);

        let events = self.events.clone();
        let cycle = self.cycle;
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RetryElapsed { cycle });
        }));

        ControlFlow::Continue(())
    }

    /// Channel of the current pass. Topology events only follow a channel open.
    fn current_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        debug_assert!(self.channel.is_some(), "topology event without an open channel");
        self.channel.clone()
    }

    fn stop(&mut self) -> ControlFlow<()> {
        info!("connection manager closed");
        self.transition(ConnectionState::Closed);
        ControlFlow::Break(())
    }

    /// Closes `connection` in the background and reports it as closed.
    fn close_connection(&self, connection: Arc<dyn AmqpConnection>) {
        let cycle = self.cycle;
        self.spawn_stage(async move {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "error closing the connection");
            }

            Event::ConnectionClosed {
                cycle,
                reason: "closed by client".to_owned(),
            }
        });
    }

    fn spawn_stage<F>(&self, stage: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(stage.await);
        });
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!(from = ?self.state, to = ?state, "connection state changed");
        self.state = state;
        self.status.send_modify(|s| s.state = state);
    }

    fn publish_counts(&self) {
        let (declared, bound) = (self.declared_count, self.bound_count);
        self.status.send_modify(|s| {
            s.declared_queues = declared;
            s.bound_queues = bound;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockAmqpChannel, MockAmqpConnection, MockAmqpTransport};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::Instant;

    fn params() -> ConnectionParameters {
        ConnectionParameters::default()
            .exchange("orders.changes")
            .retry_delay(Duration::from_secs(1))
    }

    fn accepting_channel() -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_, _| Ok(()));
        channel
    }

    fn connection_with(channel: MockAmqpChannel) -> Arc<dyn AmqpConnection> {
        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let mut connection = MockAmqpConnection::new();
        connection
            .expect_open_channel()
            .returning(move || Ok(channel.clone()));
        connection.expect_close().times(1).returning(|| Ok(()));
        Arc::new(connection)
    }

    /// Hands out `connection` on the first attempt and refuses every later one.
    fn transport_once(connection: Arc<dyn AmqpConnection>) -> MockAmqpTransport {
        let attempts = AtomicUsize::new(0);
        let mut transport = MockAmqpTransport::new();
        transport.expect_connect().returning(move |_, _| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(connection.clone())
            } else {
                Err(AmqpError::ConnectionError("connection refused".to_owned()))
            }
        });
        transport
    }

    #[tokio::test]
    async fn ready_without_queues_once_exchange_is_declared() {
        let transport = transport_once(connection_with(accepting_channel()));
        let handle = ConnectionManager::new(params(), Arc::new(transport)).start();

        handle.wait_ready().await.unwrap();

        let status = handle.current();
        assert_eq!(status.declared_queues, 0);
        assert_eq!(status.connect_attempts, 1);
        assert_eq!(status.last_error, None);

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_leaves_manager_in_closed_state() {
        let transport = transport_once(connection_with(accepting_channel()));
        let manager = ConnectionManager::new(params(), Arc::new(transport))
            .add_queue_definition(QueueDefinition::new("billing", "order.created"));
        assert_eq!(manager.queues().len(), 1);

        let handle = manager.start();
        handle.wait_ready().await.unwrap();
        let status = handle.status();

        handle.close().await.unwrap();

        assert_eq!(status.borrow().state, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_retried_after_delay() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_connect()
            .times(2)
            .returning(|_, _| Err(AmqpError::ConnectionError("connection refused".to_owned())));

        let started = Instant::now();
        let handle = ConnectionManager::new(params(), Arc::new(transport)).start();
        let mut status = handle.status();

        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert_eq!(
            handle.current().last_error,
            Some(AmqpError::ConnectionError("connection refused".to_owned()))
        );

        status.wait_for(|s| s.connect_attempts == 2).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        handle.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_exchange_closes_connection_and_reconnects() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_declare_queue().never();

        let transport = transport_once(connection_with(channel));
        let handle = ConnectionManager::new(params(), Arc::new(transport))
            .add_queue_definition(QueueDefinition::new("billing", "order.created"))
            .start();
        let mut status = handle.status();

        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert_eq!(
            handle.current().last_error,
            Some(AmqpError::DeclareExchangeError("orders.changes".to_owned()))
        );

        status.wait_for(|s| s.connect_attempts == 2).await.unwrap();
        handle.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_binding_resets_counters() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|def, exchange| {
            Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                def.name().to_owned(),
            ))
        });

        let transport = transport_once(connection_with(channel));
        let handle = ConnectionManager::new(params(), Arc::new(transport))
            .add_queue_definition(QueueDefinition::new("billing", "order.created"))
            .start();
        let mut status = handle.status();

        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .unwrap();

        let current = handle.current();
        assert_eq!(current.declared_queues, 0);
        assert_eq!(current.bound_queues, 0);
        assert_eq!(
            current.last_error,
            Some(AmqpError::BindingExchangeToQueueError(
                "orders.changes".to_owned(),
                "billing".to_owned()
            ))
        );

        handle.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_retry_wait_cancels_reconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut transport = MockAmqpTransport::new();
        transport.expect_connect().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ConnectionError("connection refused".to_owned()))
        });

        let handle = ConnectionManager::new(params(), Arc::new(transport)).start();
        let mut status = handle.status();
        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .unwrap();

        handle.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(status.borrow().state, ConnectionState::Closed);
    }
}
