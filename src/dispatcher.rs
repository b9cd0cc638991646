// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Loop
//!
//! A [`Subscription`] owns everything needed to process the deliveries of one
//! queue: its own handler registry, the delivery queue fed by the consumer,
//! the acknowledgment strategy and the publisher used for replies. Nothing is
//! process-wide, so several subscriptions can be opened and closed
//! independently.
//!
//! For each delivery the loop:
//! 1. opens a consumer span from the propagated trace context
//! 2. completes the pending RPC, if the delivery is a reply to one
//! 3. otherwise resolves the handlers and invokes them all
//! 4. publishes replies (or fault replies) to the request's `reply_to`
//! 5. settles the delivery through the acknowledgment strategy
//!
//! Handler faults are reported to the trace collaborator and never stop the
//! loop.

use crate::{
    ack::{strategy_for, AckMode, AckStrategy},
    channel::LapinChannel,
    consumer::start_consumer,
    correlation::CorrelationTable,
    delivery_queue::{DeliveryQueue, QueuedDelivery},
    envelope::{Contract, Envelope, FilterInfo, Header},
    errors::BusError,
    handler::CallHandler,
    otel,
    publisher::BusPublisher,
    queue::QueueDefinition,
    registry::SubscriptionRegistry,
    trace::{BusTrace, TracingBusTrace},
    transaction::{Transaction, TransactionOutcome},
};
use futures_util::future::join_all;
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status, TraceContextExt},
    Context,
};
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, warn};

/// How handler invocations are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduler {
    /// One delivery at a time, in broker delivery order.
    #[default]
    Inline,
    /// Up to N deliveries in flight. Relative order is not preserved and
    /// acks may reach the broker out of order.
    Bounded(usize),
}

impl Scheduler {
    fn permits(&self) -> usize {
        match self {
            Scheduler::Inline => 1,
            Scheduler::Bounded(n) => (*n).max(1),
        }
    }
}

/// Dispatch policy of a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionOptions {
    pub ack_mode: AckMode,
    pub scheduler: Scheduler,
    /// Requeue deliveries whose payload cannot be decoded instead of dropping
    /// them.
    pub redeliver_undecodable: bool,
    /// Headers every subscribed handler requires.
    pub filter_headers: Vec<Header>,
    /// Subscribed handlers also receive subtypes of their contract.
    pub hierarchy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accept,
    Reject,
}

/// One queue's handlers, delivery queue and dispatch loop.
pub struct Subscription {
    registry: SubscriptionRegistry,
    queue: Arc<DeliveryQueue<QueuedDelivery>>,
    publisher: Arc<BusPublisher>,
    ack: Arc<dyn AckStrategy>,
    options: SubscriptionOptions,
    trace: Arc<dyn BusTrace>,
    correlation: Option<Arc<CorrelationTable>>,
    in_flight: Arc<Semaphore>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<usize>>>,
}

impl Subscription {
    /// Creates a closed subscription with an empty registry.
    ///
    /// # Parameters
    /// * `publisher` - Used for replies; its channel also settles deliveries
    /// * `options` - Acknowledgment mode, scheduler and subscription filter
    ///
    /// # Returns
    /// A subscription that dispatches once [`Self::open`] is called
    pub fn new(publisher: Arc<BusPublisher>, options: SubscriptionOptions) -> Self {
        Subscription {
            registry: SubscriptionRegistry::new(),
            queue: Arc::new(DeliveryQueue::new()),
            ack: strategy_for(options.ack_mode, publisher.channel()),
            in_flight: Arc::new(Semaphore::new(options.scheduler.permits())),
            publisher,
            options,
            trace: Arc::new(TracingBusTrace),
            correlation: None,
            dispatch_loop: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn BusTrace>) -> Self {
        self.trace = trace;
        self
    }

    /// Deliveries whose correlation id is pending in `table` complete that
    /// request instead of being routed to handlers.
    pub fn with_correlation(mut self, table: Arc<CorrelationTable>) -> Self {
        self.correlation = Some(table);
        self
    }

    /// The queue the consumer feeds.
    pub fn queue(&self) -> Arc<DeliveryQueue<QueuedDelivery>> {
        self.queue.clone()
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Registers `handler` for deliveries matching `filter`.
    ///
    /// # Parameters
    /// * `filter` - Contract and required headers
    /// * `handler` - The handler to invoke
    /// * `hierarchy` - Also match contracts declaring `filter`'s contract as
    ///   an ancestor
    ///
    /// # Returns
    /// `false` if the same filter is already registered with the same
    /// hierarchy flag, or the subscription is closed
    pub fn register(&self, filter: FilterInfo, handler: CallHandler, hierarchy: bool) -> bool {
        self.registry.register(filter, handler, hierarchy)
    }

    /// Registers `handler` for contract `T` with the subscription's header
    /// filter and hierarchy setting.
    pub fn subscribe<T: Contract>(&self, handler: CallHandler) -> bool {
        self.registry.register_type::<T>();

        let filter = self
            .options
            .filter_headers
            .iter()
            .cloned()
            .fold(FilterInfo::new(T::contract_key()), FilterInfo::with_header);

        self.registry.register(filter, handler, self.options.hierarchy)
    }

    /// Makes the ancestors of `T` known, so hierarchy handlers receive it.
    pub fn register_type<T: Contract>(&self) {
        self.registry.register_type::<T>();
    }

    pub fn is_open(&self) -> bool {
        self.registry.is_open()
    }

    /// Starts the dispatch loop. Opening twice is a no-op; opening after
    /// [`Self::close`] fails.
    pub fn open(self: &Arc<Self>) -> Result<(), BusError> {
        if !self.registry.open() {
            return Err(BusError::SubscriptionClosed);
        }

        let mut dispatch_loop = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dispatch_loop.is_none() {
            *dispatch_loop = Some(tokio::spawn(self.clone().run()));
        }

        Ok(())
    }

    /// Declares `def` and consumes it into this subscription's queue.
    ///
    /// Deliveries are settled through the publisher's channel, so the
    /// publisher must be built over `channel`: delivery tags are only valid
    /// on the channel that received them.
    pub async fn connect(
        &self,
        channel: &LapinChannel,
        def: &QueueDefinition,
    ) -> Result<(), BusError> {
        if self.registry.is_closed() {
            return Err(BusError::SubscriptionClosed);
        }

        let pump = start_consumer(
            channel,
            def,
            self.queue.clone(),
            self.publisher.channel(),
            self.ack.settles_on_delivery(),
        )
        .await?;

        let previous = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(pump);
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    /// Dispatches one delivery on the calling task.
    ///
    /// The call counts as in-flight work, so [`Self::close`] waits for it. It
    /// also takes a scheduler slot: with [`Scheduler::Inline`] concurrent
    /// callers are processed one at a time.
    ///
    /// # Returns
    /// [`BusError::SubscriptionClosed`] if the subscription is closed, before
    /// or while waiting for a slot. The delivery is then left unsettled and
    /// the caller remains responsible for it.
    pub async fn dispatch(&self, item: QueuedDelivery) -> Result<(), BusError> {
        if self.registry.is_closed() {
            return Err(BusError::SubscriptionClosed);
        }

        let _permit = match self.in_flight.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(BusError::SubscriptionClosed),
        };
        if self.registry.is_closed() {
            return Err(BusError::SubscriptionClosed);
        }

        self.process(item).await;
        Ok(())
    }

    /// Stops accepting deliveries, drains what is already queued and waits for
    /// in-flight handlers, including their transaction outcome. Idempotent.
    pub async fn close(&self) {
        self.registry.close();

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }

        self.queue.close();

        let dispatch_loop = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatch_loop) = dispatch_loop {
            if let Err(err) = dispatch_loop.await {
                error!(error = err.to_string(), "dispatch loop failure");
            }
        }

        let permits = self.options.scheduler.permits() as u32;
        match self.in_flight.acquire_many(permits).await {
            Ok(drained) => drop(drained),
            Err(err) => error!(error = err.to_string(), "failure waiting for in-flight handlers"),
        }

        debug!("subscription closed");
    }

    async fn run(self: Arc<Self>) {
        while let Ok(item) = self.queue.dequeue_async().await {
            match self.options.scheduler {
                Scheduler::Inline => self.process(item).await,
                Scheduler::Bounded(_) => {
                    let permit = match self.in_flight.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(err) => {
                            error!(error = err.to_string(), "scheduler closed");
                            break;
                        }
                    };

                    let this = self.clone();
                    tokio::spawn(async move {
                        this.process(item).await;
                        drop(permit);
                    });
                }
            }
        }

        debug!("dispatch loop stopped");
    }

    async fn process(&self, item: QueuedDelivery) {
        let QueuedDelivery {
            tag,
            envelope: env,
            redelivered,
        } = item;

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&env, &tracer);
        let ctx = ctx.with_remote_span_context(span.span_context().clone());

        debug!(contract = %env.contract, tag, redelivered, "received");
        self.trace.message_arrived(&env);

        if self.complete_rpc(&env) {
            self.settle(tag, self.ack.accept(tag).await, &mut span);
            return;
        }

        let resolution = self.registry.resolve(&env.contract, &env.headers);
        if resolution.is_empty() {
            if resolution.filtered_out {
                self.trace.filtered_out(&env);
            } else {
                self.trace.unregistered_message(&env);
            }
            self.settle(tag, self.ack.accept(tag).await, &mut span);
            return;
        }

        let result = match self.options.ack_mode {
            AckMode::AmbientTransaction => {
                let tx = Transaction::new();
                let disposition = tx
                    .scope(self.invoke(&ctx, &env, resolution.handlers, &mut span))
                    .await;
                self.complete_transaction(&tx, tag, disposition).await
            }
            _ => match self.invoke(&ctx, &env, resolution.handlers, &mut span).await {
                Disposition::Accept => self.ack.accept(tag).await,
                Disposition::Reject => self.ack.reject(tag).await,
            },
        };

        self.settle(tag, result, &mut span);
    }

    /// Completes the pending request this delivery replies to, if any.
    fn complete_rpc(&self, env: &Envelope) -> bool {
        let (Some(table), Some(id)) = (&self.correlation, env.correlation_id.as_deref()) else {
            return false;
        };
        if !table.is_pending(id) {
            return false;
        }

        if let Err(err) = table.complete(id, env.clone()) {
            debug!(error = err.to_string(), correlation_id = id, "late reply ignored");
        }
        true
    }

    /// Runs every handler and decides how the delivery is settled. A fault in
    /// one handler does not prevent the others from running.
    async fn invoke(
        &self,
        ctx: &Context,
        env: &Envelope,
        handlers: Vec<CallHandler>,
        span: &mut BoxedSpan,
    ) -> Disposition {
        let serializers = self.publisher.serializers();
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.dispatch(env.clone(), serializers.clone())),
        )
        .await;

        let mut faulted = false;
        let mut undecodable = false;

        for result in results {
            let err = match result {
                Ok(Some(reply)) => {
                    self.send_reply(ctx, env, reply).await;
                    continue;
                }
                Ok(None) => continue,
                Err(err) => err,
            };

            span.record_error(&err);
            if err.is_payload_error() {
                undecodable = true;
                self.trace.deserialize_failure(env, &err);
            } else {
                faulted = true;
                self.trace.dispatch_failure(env, &err);
            }

            if let Some(reply_to) = &env.reply_to {
                if let Err(err) = self.publisher.fault_reply(ctx, env, reply_to, &err).await {
                    self.trace.dispatch_failure(env, &err);
                }
            }
        }

        if faulted || (undecodable && self.options.redeliver_undecodable) {
            Disposition::Reject
        } else {
            Disposition::Accept
        }
    }

    async fn send_reply(&self, ctx: &Context, request: &Envelope, reply: Envelope) {
        let Some(reply_to) = &request.reply_to else {
            debug!(contract = %request.contract, "reply dropped, request has no reply address");
            return;
        };

        if let Err(err) = self.publisher.reply(ctx, &reply, reply_to).await {
            self.trace.dispatch_failure(request, &err);
        }
    }

    /// Settles a delivery processed inside `tx`. Handlers may have completed
    /// `tx` themselves: only a commit they made still lets the delivery be
    /// acked, any other outcome requeues it.
    async fn complete_transaction(
        &self,
        tx: &Transaction,
        tag: u64,
        disposition: Disposition,
    ) -> Result<(), BusError> {
        let outcome = tx.outcome();

        match (disposition, outcome) {
            (Disposition::Accept, None) => {
                let accepted = tx.scope(self.ack.accept(tag)).await;
                match tx.commit().await {
                    Ok(TransactionOutcome::Committed) => {}
                    Ok(outcome) => {
                        warn!(tag, ?outcome, transaction = tx.id(), "delivery not committed")
                    }
                    Err(err) => warn!(
                        error = err.to_string(),
                        tag,
                        transaction = tx.id(),
                        "failure to commit"
                    ),
                }
                accepted
            }
            (Disposition::Accept, Some(TransactionOutcome::Committed)) => {
                debug!(tag, transaction = tx.id(), "transaction committed by handler");
                self.ack.accept(tag).await
            }
            (_, outcome) => {
                if outcome.is_none() {
                    if let Err(err) = tx.rollback().await {
                        warn!(
                            error = err.to_string(),
                            tag,
                            transaction = tx.id(),
                            "failure to roll back"
                        );
                    }
                } else {
                    debug!(
                        tag,
                        ?outcome,
                        transaction = tx.id(),
                        "transaction completed by handler"
                    );
                }
                self.ack.reject(tag).await
            }
        }
    }

    fn settle(&self, tag: u64, result: Result<(), BusError>, span: &mut BoxedSpan) {
        match result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(error = err.to_string(), tag, "failure to settle delivery");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to settle delivery"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{MockAmqpChannel, PublishOutcome, SerializedChannel},
        envelope::ContractKey,
        properties::headers_from_table,
        serializer::Serializers,
        trace::recording::{Event, RecordingTrace},
        transaction::{Participant, Vote},
    };
    use async_trait::async_trait;
    use mockall::predicate::{always, eq};
    use serde::{Deserialize, Serialize};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Add {
        a: i32,
        b: i32,
    }

    impl Contract for Add {
        fn contract_key() -> ContractKey {
            ContractKey::new("Add", "math")
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sum {
        value: i32,
    }

    impl Contract for Sum {
        fn contract_key() -> ContractKey {
            ContractKey::new("Sum", "math")
        }
    }

    fn subscription(
        mock: MockAmqpChannel,
        options: SubscriptionOptions,
    ) -> (Arc<Subscription>, Arc<RecordingTrace>) {
        let publisher = Arc::new(BusPublisher::new(
            SerializedChannel::new(Arc::new(mock)),
            Arc::new(Serializers::default()),
        ));
        let trace = Arc::new(RecordingTrace::default());
        let sub = Subscription::new(publisher, options).with_trace(trace.clone());
        (Arc::new(sub), trace)
    }

    fn delivery(tag: u64, env: Envelope) -> QueuedDelivery {
        QueuedDelivery::new(tag, env, false)
    }

    fn add(a: i32, b: i32) -> Envelope {
        Serializers::default().encode(&Add { a, b }).unwrap()
    }

    #[tokio::test]
    async fn test_published_message_is_received_once_and_acked() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        mock.expect_nack().times(0);

        let (sub, trace) = subscription(mock, SubscriptionOptions::default());

        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = received.clone();
        assert!(sub.register(
            FilterInfo::new(ContractKey::new("Foo", "ns")),
            CallHandler::raw(move |env: &Envelope| -> Result<Option<Envelope>, BusError> {
                seen.lock().unwrap().push(env.data.clone());
                Ok(None)
            }),
            false,
        ));

        sub.open().unwrap();
        sub.queue()
            .enqueue(delivery(
                1,
                Envelope::new(ContractKey::new("Foo", "ns"), b"boo".to_vec()),
            ))
            .unwrap();
        sub.close().await;

        assert_eq!(*received.lock().unwrap(), vec![b"boo".to_vec()]);
        assert_eq!(trace.events(), vec![Event::Arrived("Foo".to_owned())]);
    }

    #[tokio::test]
    async fn test_inline_scheduler_preserves_delivery_order() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(5).returning(|_| Ok(()));

        let (sub, _) = subscription(mock, SubscriptionOptions::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        sub.subscribe::<Add>(CallHandler::action_async(move |add: Add| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis((5 - add.a) as u64)).await;
                seen.lock().unwrap().push(add.a);
                Ok::<_, BusError>(())
            }
        }));

        for i in 0..5 {
            sub.queue().enqueue(delivery(i as u64, add(i, 0))).unwrap();
        }
        sub.open().unwrap();
        sub.close().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_scheduler_finishes_in_flight_work_on_close() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(8).returning(|_| Ok(()));

        let (sub, _) = subscription(
            mock,
            SubscriptionOptions {
                scheduler: Scheduler::Bounded(4),
                ..Default::default()
            },
        );
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        sub.subscribe::<Add>(CallHandler::action_async(move |_: Add| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BusError>(())
            }
        }));

        sub.open().unwrap();
        for i in 0..8 {
            sub.queue().enqueue(delivery(i, add(1, 1))).unwrap();
        }
        sub.close().await;

        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_handler_fault_requeues_and_is_reported() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(4), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, trace) = subscription(mock, SubscriptionOptions::default());
        sub.subscribe::<Add>(CallHandler::action(|_: Add| Err::<(), _>("boom")));

        sub.dispatch(delivery(4, add(1, 2))).await.unwrap();

        assert_eq!(
            trace.events(),
            vec![
                Event::Arrived("Add".to_owned()),
                Event::DispatchFailure("handler failure: boom".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn test_one_faulting_handler_does_not_stop_the_others() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_nack().times(1).returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, SubscriptionOptions::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        sub.register(
            FilterInfo::new(Add::contract_key()),
            CallHandler::action(move |_: Add| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BusError>(())
            }),
            false,
        );
        sub.register(
            FilterInfo::new(Add::contract_key()).with_header(Header::new("k", "v")),
            CallHandler::action(|_: Add| Err::<(), _>("boom")),
            false,
        );

        sub.dispatch(delivery(1, add(1, 2).with_header(Header::new("k", "v"))))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_function_reply_goes_back_to_the_caller() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish()
            .with(eq(""), eq("caller"), eq(false), always(), always())
            .times(1)
            .returning(|_, _, _, props, body| {
                assert_eq!(body, br#"{"value":5}"#);
                assert_eq!(props.correlation_id().as_ref().map(|c| c.as_str()), Some("c-1"));
                Ok(PublishOutcome::Delivered)
            });
        mock.expect_ack().with(eq(2)).times(1).returning(|_| Ok(()));

        let (sub, _) = subscription(mock, SubscriptionOptions::default());
        sub.subscribe::<Add>(CallHandler::function(|add: Add| {
            Ok::<_, BusError>(Sum { value: add.a + add.b })
        }));

        let request = add(2, 3).with_correlation_id("c-1").with_reply_to("caller");
        sub.dispatch(delivery(2, request)).await.unwrap();
    }

    #[tokio::test]
    async fn test_faulted_request_gets_a_fault_reply() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _, _, props, _| {
                let headers = headers_from_table(&props.headers().clone().unwrap_or_default());
                assert!(headers.iter().any(|h| matches!(h, Header::Exception(_))));
                Ok(PublishOutcome::Delivered)
            });
        mock.expect_nack().times(1).returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, SubscriptionOptions::default());
        sub.subscribe::<Add>(CallHandler::function(|_: Add| Err::<Sum, _>("div by zero")));

        let request = add(1, 0).with_correlation_id("c-2").with_reply_to("caller");
        sub.dispatch(delivery(3, request)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_and_filtered_messages_are_consumed() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(2).returning(|_| Ok(()));

        let (sub, trace) = subscription(
            mock,
            SubscriptionOptions {
                filter_headers: vec![Header::new("region", "eu")],
                ..Default::default()
            },
        );
        sub.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(())));

        sub.dispatch(delivery(1, Envelope::new(ContractKey::new("Nope", "ns"), vec![])))
            .await
            .unwrap();
        sub.dispatch(delivery(2, add(1, 1).with_header(Header::new("region", "us"))))
            .await
            .unwrap();

        assert_eq!(
            trace.events(),
            vec![
                Event::Arrived("Nope".to_owned()),
                Event::Unregistered("Nope".to_owned()),
                Event::Arrived("Add".to_owned()),
                Event::FilteredOut("Add".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped_by_default() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        mock.expect_nack().times(0);

        let (sub, trace) = subscription(mock, SubscriptionOptions::default());
        sub.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(())));

        sub.dispatch(delivery(1, Envelope::new(Add::contract_key(), b"garbage".to_vec())))
            .await
            .unwrap();

        assert!(trace
            .events()
            .contains(&Event::DeserializeFailure("Add".to_owned())));
    }

    #[tokio::test]
    async fn test_undecodable_payload_can_be_redelivered() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(1), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, _) = subscription(
            mock,
            SubscriptionOptions {
                redeliver_undecodable: true,
                ..Default::default()
            },
        );
        sub.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(())));

        sub.dispatch(delivery(1, Envelope::new(Add::contract_key(), b"garbage".to_vec())))
            .await
            .unwrap();
    }

    struct Veto;

    #[async_trait]
    impl Participant for Veto {
        async fn prepare(&self) -> Vote {
            Vote::ForceRollback
        }

        async fn commit(&self) {}

        async fn rollback(&self) {}

        async fn in_doubt(&self) {}
    }

    fn ambient() -> SubscriptionOptions {
        SubscriptionOptions {
            ack_mode: AckMode::AmbientTransaction,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ambient_transaction_commit_acks() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().with(eq(9)).times(1).returning(|_| Ok(()));
        mock.expect_nack().times(0);

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action(|_: Add| {
            assert!(Transaction::current().is_some());
            Ok::<_, BusError>(())
        }));

        sub.dispatch(delivery(9, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_ambient_transaction_vetoed_by_handler_requeues() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(9), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action(|_: Add| {
            Transaction::current()
                .ok_or(BusError::InternalError)?
                .enlist(Arc::new(Veto))
        }));

        sub.dispatch(delivery(9, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_ambient_transaction_handler_fault_requeues_once() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(9), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action(|_: Add| Err::<(), _>("boom")));

        sub.dispatch(delivery(9, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_rollback_requeues_instead_of_acking() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(5), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action_async(|_: Add| async {
            Transaction::current()
                .ok_or(BusError::InternalError)?
                .rollback()
                .await?;
            Ok::<_, BusError>(())
        }));

        sub.dispatch(delivery(5, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_rollback_then_fault_still_settles() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(6), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action_async(|_: Add| async {
            Transaction::current()
                .ok_or(BusError::InternalError)?
                .rollback()
                .await?;
            Err::<(), _>(BusError::Handler("boom".to_owned()))
        }));

        sub.dispatch(delivery(6, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_commit_still_acks() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        mock.expect_nack().times(0);

        let (sub, _) = subscription(mock, ambient());
        sub.subscribe::<Add>(CallHandler::action_async(|_: Add| async {
            Transaction::current()
                .ok_or(BusError::InternalError)?
                .commit()
                .await?;
            Ok::<_, BusError>(())
        }));

        sub.dispatch(delivery(7, add(1, 1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_inline_dispatch() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));

        let (sub, _) = subscription(mock, SubscriptionOptions::default());
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        sub.subscribe::<Add>(CallHandler::action_async(move |_: Add| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BusError>(())
            }
        }));

        let running = sub.clone();
        let dispatched =
            tokio::spawn(async move { running.dispatch(delivery(1, add(1, 1))).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        sub.close().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(dispatched.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_reply_on_dedicated_queue_completes_pending_request() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));

        let table = CorrelationTable::new(Arc::new(Serializers::default()));
        let handle = table.register::<Sum>("r-1", Duration::from_secs(5)).unwrap();

        let publisher = Arc::new(BusPublisher::new(
            SerializedChannel::new(Arc::new(mock)),
            Arc::new(Serializers::default()),
        ));
        let sub = Subscription::new(publisher, SubscriptionOptions::default())
            .with_correlation(table.clone());
        sub.subscribe::<Sum>(CallHandler::action(|_: Sum| -> Result<(), BusError> {
            panic!("replies must not reach handlers")
        }));

        let reply = Serializers::default()
            .encode(&Sum { value: 3 })
            .unwrap()
            .with_correlation_id("r-1");
        sub.dispatch(delivery(1, reply)).await.unwrap();

        assert_eq!(handle.wait().await, Ok(Sum { value: 3 }));
    }

    #[tokio::test]
    async fn test_closed_subscription_rejects_work() {
        let (sub, _) = subscription(MockAmqpChannel::new(), SubscriptionOptions::default());
        sub.open().unwrap();
        sub.close().await;
        sub.close().await;

        assert_eq!(sub.open(), Err(BusError::SubscriptionClosed));
        assert!(!sub.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(()))));
        assert_eq!(
            sub.dispatch(delivery(1, add(1, 1))).await,
            Err(BusError::SubscriptionClosed)
        );
        assert_eq!(
            sub.queue().enqueue(delivery(2, add(1, 1))),
            Err(BusError::QueueClosed)
        );
    }

    #[tokio::test]
    async fn test_independent_subscriptions() {
        let mut first = MockAmqpChannel::new();
        first.expect_ack().times(0);
        let mut second = MockAmqpChannel::new();
        second.expect_ack().times(2).returning(|_| Ok(()));

        let (a, _) = subscription(first, SubscriptionOptions::default());
        let (b, _) = subscription(second, SubscriptionOptions::default());
        a.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(())));
        b.subscribe::<Add>(CallHandler::action(|_: Add| Ok::<_, BusError>(())));

        a.close().await;
        assert_eq!(
            a.dispatch(delivery(1, add(1, 1))).await,
            Err(BusError::SubscriptionClosed)
        );

        b.dispatch(delivery(1, add(1, 1))).await.unwrap();
        b.dispatch(delivery(2, Envelope::new(ContractKey::new("x", "y"), vec![])))
            .await
            .unwrap();
        a.close().await;
    }
}
