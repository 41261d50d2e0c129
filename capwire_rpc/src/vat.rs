//! The session engine: one vat per connection.
//!
//! A spawned event loop owns the four tables and serializes every mutation;
//! handles interact with it through events. Local method bodies and the
//! restorer run on worker tasks and post their completions back, so the
//! loop never awaits user code.

use crate::{
    capability::{CapDispatch, Capability, LocalRegistry, Payload, PromiseVariant, Restorer},
    message::{self, RpcMessage, WireCapDescriptor, WireReturn, WireTarget},
    rpc_schema as schema,
    statistics::SessionStatistics,
    tables::{
        duplicate_outcome, AnswerEntry, AnswerState, Answers, Exports, Imports, Outcome,
        QueuedCall, QueuedInboundCall, QuestionEntry, Questions,
    },
    AnswerId, ExportId, ImportId, QuestionId, RpcError, RpcResult, Transport, VatConfiguration,
};
use capwire::{FrameParser, MethodDescriptor};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
enum VatEvent {
    Call {
        target: Capability,
        method: MethodDescriptor,
        params: Payload,
        reply: oneshot::Sender<RpcResult<QuestionId>>,
    },
    Restore {
        object_id: String,
        reply: oneshot::Sender<RpcResult<QuestionId>>,
    },
    Wait {
        question_id: QuestionId,
        reply: oneshot::Sender<RpcResult<Payload>>,
    },
    CallerGone {
        question_id: QuestionId,
    },
    Inbound {
        bytes: Vec<u8>,
    },
    AnswerReady {
        answer_id: AnswerId,
        outcome: Outcome,
    },
    LocalQuestionDone {
        question_id: QuestionId,
        outcome: Outcome,
    },
    Statistics {
        reply: oneshot::Sender<SessionStatistics>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Stopped,
}

/// Clonable handle to a running session.
#[derive(Debug, Clone)]
pub struct Vat {
    tx: mpsc::UnboundedSender<VatEvent>,
    default_wait_timeout: Option<Duration>,
}

impl Vat {
    /// Starts the session event loop on the current tokio runtime.
    ///
    /// `locals` holds the objects this vat serves; `restorer` answers
    /// inbound `restore` requests. Inbound bytes arrive through
    /// [`Vat::feed`] or [`Vat::pump`].
    pub fn spawn(
        config: VatConfiguration,
        transport: Box<dyn Transport>,
        locals: LocalRegistry,
        restorer: Option<Arc<dyn Restorer>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let vat = Self {
            tx: tx.clone(),
            default_wait_timeout: config.default_wait_timeout(),
        };
        let core = VatCore {
            parser: FrameParser::new(config.reader_limits()),
            config,
            transport,
            questions: Questions::default(),
            answers: Answers::default(),
            exports: Exports::default(),
            imports: Imports::default(),
            locals,
            restorer,
            stats: SessionStatistics::default(),
            state: SessionState::Open,
            self_handle: vat.clone(),
        };
        tokio::spawn(run_loop(core, rx));
        vat
    }

    /// Hands received transport bytes to the session.
    pub fn feed(&self, bytes: Vec<u8>) -> RpcResult<()> {
        self.tx
            .send(VatEvent::Inbound { bytes })
            .map_err(|_| RpcError::Stopped)
    }

    /// Spawns a task that drains `rx` into the session.
    pub fn pump(&self, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let vat = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if vat.feed(bytes).is_err() {
                    break;
                }
            }
            debug!("transport pump ended");
        });
    }

    /// Sends a call (or pipelines it onto a promise) and returns without
    /// waiting for the answer.
    pub async fn call(
        &self,
        target: Capability,
        method: MethodDescriptor,
        params: Payload,
    ) -> RpcResult<PendingCall> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VatEvent::Call {
                target,
                method,
                params,
                reply,
            })
            .map_err(|_| RpcError::Stopped)?;
        let question_id = rx.await.map_err(|_| RpcError::Stopped)??;
        Ok(PendingCall::new(self.clone(), question_id))
    }

    /// Issues a `restore` question for a published object id.
    ///
    /// The restored capability is at pointer 0 of the result payload;
    /// `PendingCall::pipeline(vec![0])` is the promise for it.
    pub async fn restore(&self, object_id: &str) -> RpcResult<PendingCall> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VatEvent::Restore {
                object_id: object_id.to_string(),
                reply,
            })
            .map_err(|_| RpcError::Stopped)?;
        let question_id = rx.await.map_err(|_| RpcError::Stopped)??;
        Ok(PendingCall::new(self.clone(), question_id))
    }

    /// Snapshot of the session counters.
    pub async fn statistics(&self) -> RpcResult<SessionStatistics> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VatEvent::Statistics { reply })
            .map_err(|_| RpcError::Stopped)?;
        rx.await.map_err(|_| RpcError::Stopped)
    }

    /// Terminates the session: aborts the peer best-effort and fails every
    /// outstanding question.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(VatEvent::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn post(&self, event: VatEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sends `finish` when the last clone goes out of scope.
#[derive(Debug)]
struct FinishGuard {
    tx: mpsc::UnboundedSender<VatEvent>,
    question_id: QuestionId,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(VatEvent::CallerGone {
            question_id: self.question_id,
        });
    }
}

/// Handle to an outstanding question.
///
/// Clones share one liveness guard; when the last clone is dropped the
/// question is finished (cancelling it if no return arrived, releasing the
/// result capabilities otherwise).
#[derive(Debug, Clone)]
pub struct PendingCall {
    vat: Vat,
    question_id: QuestionId,
    _guard: Arc<FinishGuard>,
}

impl PendingCall {
    fn new(vat: Vat, question_id: QuestionId) -> Self {
        let guard = FinishGuard {
            tx: vat.tx.clone(),
            question_id,
        };
        Self {
            vat,
            question_id,
            _guard: Arc::new(guard),
        }
    }

    pub fn question_id(&self) -> QuestionId {
        self.question_id
    }

    /// A promise for (a pointer-field path into) this question's result,
    /// usable as a call target or a payload capability right away.
    pub fn pipeline(&self, transform: Vec<u16>) -> Capability {
        Capability::promised_answer(self.question_id, transform)
    }

    /// Blocks until the question resolves; `timeout` falls back to the
    /// session default. A timeout fails this wait, not the question.
    pub async fn wait(&self, timeout: Option<Duration>) -> RpcResult<Payload> {
        let (reply, rx) = oneshot::channel();
        self.vat
            .tx
            .send(VatEvent::Wait {
                question_id: self.question_id,
                reply,
            })
            .map_err(|_| RpcError::Stopped)?;
        match timeout.or(self.vat.default_wait_timeout) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result.map_err(|_| RpcError::Stopped)?,
                Err(_) => Err(RpcError::Timeout),
            },
            None => rx.await.map_err(|_| RpcError::Stopped)?,
        }
    }
}

async fn run_loop(mut core: VatCore, mut rx: mpsc::UnboundedReceiver<VatEvent>) {
    debug!("session event loop started");
    while let Some(event) = rx.recv().await {
        let is_stop = matches!(event, VatEvent::Stop { .. });
        core.handle_event(event);
        if is_stop {
            break;
        }
    }
    debug!("session event loop ended");
}

struct VatCore {
    config: VatConfiguration,
    transport: Box<dyn Transport>,
    parser: FrameParser,
    questions: Questions,
    answers: Answers,
    exports: Exports,
    imports: Imports,
    locals: LocalRegistry,
    restorer: Option<Arc<dyn Restorer>>,
    stats: SessionStatistics,
    state: SessionState,
    self_handle: Vat,
}

impl VatCore {
    fn handle_event(&mut self, event: VatEvent) {
        match event {
            VatEvent::Call {
                target,
                method,
                params,
                reply,
            } => {
                let result = self.handle_call(target, method, params);
                let _ = reply.send(result);
            }
            VatEvent::Restore { object_id, reply } => {
                let result = self.handle_restore_request(&object_id);
                let _ = reply.send(result);
            }
            VatEvent::Wait { question_id, reply } => self.handle_wait(question_id, reply),
            VatEvent::CallerGone { question_id } => self.handle_caller_gone(question_id),
            VatEvent::Inbound { bytes } => self.handle_inbound(&bytes),
            VatEvent::AnswerReady { answer_id, outcome } => {
                self.complete_answer(answer_id, outcome);
            }
            VatEvent::LocalQuestionDone {
                question_id,
                outcome,
            } => self.fulfill_question(question_id, outcome, Vec::new()),
            VatEvent::Statistics { reply } => {
                let mut stats = self.stats;
                stats.questions_open = self.questions.len();
                stats.answers_open = self.answers.len();
                stats.exports_live = self.exports.len();
                stats.imports_live = self.imports.len();
                let _ = reply.send(stats);
            }
            VatEvent::Stop { reply } => {
                if self.state == SessionState::Open {
                    let abort = message::build_abort(
                        self.config.first_segment_words(),
                        "session stopped",
                    );
                    if let Ok(bytes) = abort {
                        let _ = self.transport.send(&bytes);
                    }
                    self.fail_session(&RpcError::Stopped);
                }
                let _ = reply.send(());
            }
        }
    }

    // -----------------------------------------------------------
    // outbound calls
    // -----------------------------------------------------------

    fn handle_call(
        &mut self,
        target: Capability,
        method: MethodDescriptor,
        params: Payload,
    ) -> RpcResult<QuestionId> {
        if self.state == SessionState::Stopped {
            return Err(RpcError::Stopped);
        }
        // placeholder entry; issue_call wires it up or queues it
        let question_id = self.questions.insert(QuestionEntry::new(true));
        match self.issue_call(question_id, target, method, params) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.remove(question_id);
                Err(e)
            }
        }
    }

    /// Routes a call that already owns `question_id` to its target: onto the
    /// wire, into a local worker, or into a promise queue.
    fn issue_call(
        &mut self,
        question_id: QuestionId,
        target: Capability,
        method: MethodDescriptor,
        params: Payload,
    ) -> RpcResult<()> {
        let mut target = target;
        // our own exports echoed back collapse to the capability behind them
        while let Capability::Exported { id } = target {
            target = self
                .exports
                .get(id)
                .ok_or(RpcError::UnknownCapability(id))?
                .cap
                .clone();
        }

        match target {
            Capability::Remote { id } => {
                self.send_wire_call(question_id, &WireTarget::ImportedCap(id), &method, &params)
            }
            Capability::Local { id } => {
                let dispatcher = self.locals.get(id).ok_or(RpcError::UnknownCapability(id))?;
                self.stats.calls_sent += 1;
                self.spawn_local_question(question_id, dispatcher, method, params);
                Ok(())
            }
            Capability::Promise {
                variant: PromiseVariant::Remote,
                id: target_question,
                transform,
            } => {
                let entry = self
                    .questions
                    .get_mut(target_question)
                    .ok_or_else(|| rpc_usage_err!("pipelining on unknown question {target_question}"))?;
                match &entry.result {
                    Some(Ok(payload)) => {
                        let payload = payload.clone();
                        let cap = payload.resolve_transform(&transform)?;
                        self.issue_call(question_id, cap, method, params)
                    }
                    Some(Err(e)) => Err(RpcError::PromiseBroken(e.to_string())),
                    None if entry.local => {
                        entry.queued_calls.push(QueuedCall {
                            transform,
                            method,
                            params,
                            question_id,
                        });
                        Ok(())
                    }
                    None => self.send_wire_call(
                        question_id,
                        &WireTarget::PromisedAnswer {
                            question_id: target_question,
                            transform,
                        },
                        &method,
                        &params,
                    ),
                }
            }
            Capability::Promise {
                variant: PromiseVariant::Answer,
                id: answer_id,
                transform,
            } => {
                let entry = self
                    .answers
                    .get_mut(answer_id)
                    .ok_or_else(|| rpc_usage_err!("pipelining on unknown answer {answer_id}"))?;
                match &entry.state {
                    AnswerState::Ready(Ok(payload)) => {
                        let payload = payload.clone();
                        let cap = payload.resolve_transform(&transform)?;
                        self.issue_call(question_id, cap, method, params)
                    }
                    AnswerState::Ready(Err(e)) => Err(RpcError::PromiseBroken(e.to_string())),
                    AnswerState::Pending => {
                        entry.queued_local_calls.push(QueuedCall {
                            transform,
                            method,
                            params,
                            question_id,
                        });
                        Ok(())
                    }
                }
            }
            Capability::Promise {
                variant: PromiseVariant::Resolve,
                ..
            } => Err(RpcError::Unimplemented(
                "promise awaiting a resolve message; this level never resolves it".to_string(),
            )),
            Capability::Unsupported => Err(RpcError::Unimplemented(
                "thirdPartyHosted capability".to_string(),
            )),
            Capability::Exported { .. } => Err(rpc_impl_err!("unresolved export after collapse")),
        }
    }

    fn send_wire_call(
        &mut self,
        question_id: QuestionId,
        target: &WireTarget,
        method: &MethodDescriptor,
        params: &Payload,
    ) -> RpcResult<()> {
        let (descriptors, param_exports) = self.translate_caps_out(&params.caps);
        let built = message::build_call(
            self.config.first_segment_words(),
            question_id,
            method.interface_id,
            method.method_id,
            target,
            &params.content,
            &descriptors,
        );
        match built.and_then(|bytes| self.send_frame(&bytes)) {
            Ok(()) => {
                if let Some(entry) = self.questions.get_mut(question_id) {
                    entry.local = false;
                    entry.param_exports = param_exports;
                }
                self.stats.calls_sent += 1;
                Ok(())
            }
            Err(e) => {
                for id in param_exports {
                    self.exports.release(id, Some(1));
                }
                Err(e)
            }
        }
    }

    fn spawn_local_question(
        &self,
        question_id: QuestionId,
        dispatcher: Arc<dyn CapDispatch>,
        method: MethodDescriptor,
        params: Payload,
    ) {
        let vat = self.self_handle.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .dispatch(method.interface_id, method.method_id, params, vat.clone())
                .await;
            vat.post(VatEvent::LocalQuestionDone {
                question_id,
                outcome,
            });
        });
    }

    fn handle_restore_request(&mut self, object_id: &str) -> RpcResult<QuestionId> {
        if self.state == SessionState::Stopped {
            return Err(RpcError::Stopped);
        }
        let question_id = self.questions.insert(QuestionEntry::new(false));
        let built = message::build_restore(
            self.config.first_segment_words(),
            question_id,
            object_id,
        );
        match built.and_then(|bytes| self.send_frame(&bytes)) {
            Ok(()) => {
                self.stats.calls_sent += 1;
                Ok(question_id)
            }
            Err(e) => {
                self.questions.remove(question_id);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------
    // waiters and caller liveness
    // -----------------------------------------------------------

    fn handle_wait(&mut self, question_id: QuestionId, reply: oneshot::Sender<RpcResult<Payload>>) {
        match self.questions.get_mut(question_id) {
            None => {
                let err = if self.state == SessionState::Stopped {
                    RpcError::Stopped
                } else {
                    rpc_usage_err!("wait on unknown question {question_id}")
                };
                let _ = reply.send(Err(err));
            }
            Some(entry) => match &entry.result {
                Some(outcome) => {
                    let _ = reply.send(duplicate_outcome(outcome));
                }
                None => entry.waiters.push(reply),
            },
        }
    }

    fn handle_caller_gone(&mut self, question_id: QuestionId) {
        let Some(entry) = self.questions.get_mut(question_id) else {
            return;
        };
        entry.originator_gone = true;
        let resolved = entry.result.is_some();
        let has_waiters = !entry.waiters.is_empty();
        if resolved || !has_waiters {
            // fulfilled, or cancelled before anyone waited
            self.finish_question(question_id);
        } else {
            debug!("originator of question {question_id} is gone, waiters remain");
        }
    }

    /// Sends `finish`, releases the result imports, drops the entry. Queued
    /// pipelined calls break.
    fn finish_question(&mut self, question_id: QuestionId) {
        let Some(entry) = self.questions.remove(question_id) else {
            return;
        };
        trace!("finishing question {question_id}");
        for queued in entry.queued_calls {
            self.fulfill_question(
                queued.question_id,
                Err(RpcError::PromiseBroken(format!(
                    "question {question_id} was finished before resolving"
                ))),
                Vec::new(),
            );
        }
        for id in entry.result_imports {
            self.imports.release(id, 1);
        }
        if !entry.local && self.state == SessionState::Open {
            let built = message::build_finish(self.config.first_segment_words(), question_id, true);
            if let Ok(bytes) = built {
                let _ = self.send_frame(&bytes);
            }
        }
    }

    /// Resolves a question: stores the outcome, notifies every waiter
    /// exactly once, runs queued pipelined calls, finishes if the
    /// originator is already gone.
    fn fulfill_question(
        &mut self,
        question_id: QuestionId,
        outcome: Outcome,
        result_imports: Vec<ImportId>,
    ) {
        let Some(entry) = self.questions.get_mut(question_id) else {
            debug!("outcome for unknown question {question_id}");
            return;
        };
        if entry.result.is_some() {
            warn!("duplicate resolution of question {question_id} ignored");
            return;
        }
        let queue_outcome = duplicate_outcome(&outcome);
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(duplicate_outcome(&outcome));
        }
        entry.result_imports = result_imports;
        entry.result = Some(outcome);
        let originator_gone = entry.originator_gone;
        let queued: Vec<QueuedCall> = entry.queued_calls.drain(..).collect();

        for call in queued {
            self.run_queued_call(call, &queue_outcome);
        }
        if originator_gone {
            self.finish_question(question_id);
        }
    }

    /// Continues a call that was queued on a promise, now that the promise
    /// has an outcome.
    fn run_queued_call(&mut self, call: QueuedCall, outcome: &Outcome) {
        let resolved = match outcome {
            Ok(payload) => payload.resolve_transform(&call.transform),
            Err(e) => Err(RpcError::PromiseBroken(e.to_string())),
        };
        match resolved {
            Ok(cap) => {
                if let Err(e) = self.issue_call(call.question_id, cap, call.method, call.params) {
                    self.fulfill_question(call.question_id, Err(e), Vec::new());
                }
            }
            Err(e) => self.fulfill_question(call.question_id, Err(e), Vec::new()),
        }
    }

    // -----------------------------------------------------------
    // inbound dispatch
    // -----------------------------------------------------------

    fn handle_inbound(&mut self, bytes: &[u8]) {
        if self.state == SessionState::Stopped {
            return;
        }
        let messages = match self.parser.feed(bytes) {
            Ok(messages) => messages,
            Err(e) => {
                error!("inbound framing failed: {e}");
                self.fail_session(&RpcError::from(e));
                return;
            }
        };
        for segments in messages {
            self.stats.messages_received += 1;
            match message::parse_message(segments) {
                Ok(msg) => self.handle_message(msg),
                // the session survives a single bad message
                Err(e) => warn!("dropping unparsable message: {e}"),
            }
        }
    }

    fn handle_message(&mut self, msg: RpcMessage) {
        match msg {
            RpcMessage::Call {
                question_id,
                interface_id,
                method_id,
                target,
                params,
            } => {
                let (caps, param_imports) = self.translate_caps_in(&params.cap_table);
                let payload = Payload {
                    content: params.root,
                    caps,
                };
                self.handle_inbound_call(
                    question_id,
                    interface_id,
                    method_id,
                    &target,
                    payload,
                    param_imports,
                );
            }
            RpcMessage::Return {
                answer_id,
                release_param_caps,
                body,
            } => self.handle_return(answer_id, release_param_caps, body),
            RpcMessage::Finish {
                question_id,
                release_result_caps,
            } => self.handle_finish(question_id, release_result_caps),
            RpcMessage::Release {
                id,
                reference_count,
            } => {
                if let Some(cap) = self.exports.release(id, Some(reference_count)) {
                    debug!("export {id} fully released, was {cap:?}");
                }
            }
            RpcMessage::Restore {
                question_id,
                object_id,
            } => self.handle_restore(question_id, &object_id),
            RpcMessage::Abort { reason } => {
                warn!("peer aborted the session: {reason}");
                self.fail_session(&RpcError::PeerAbort(reason));
            }
            RpcMessage::Unimplemented { .. } => {
                warn!("peer did not understand one of our messages");
            }
            RpcMessage::Other { tag, root } => {
                debug!("echoing message with unhandled tag {tag} as unimplemented");
                let built =
                    message::build_unimplemented(self.config.first_segment_words(), &root);
                if let Ok(bytes) = built {
                    let _ = self.send_frame(&bytes);
                }
            }
        }
    }

    fn handle_inbound_call(
        &mut self,
        question_id: AnswerId,
        interface_id: u64,
        method_id: u16,
        target: &WireTarget,
        params: Payload,
        param_imports: Vec<ImportId>,
    ) {
        self.stats.calls_received += 1;
        if !self
            .answers
            .insert(question_id, AnswerEntry::new(param_imports))
        {
            warn!("peer reused live answer id {question_id}, dropping the call");
            return;
        }
        match target {
            WireTarget::ImportedCap(id) => match self.exports.get(*id) {
                Some(entry) => {
                    let cap = entry.cap.clone();
                    self.dispatch_answer(question_id, cap, interface_id, method_id, params);
                }
                None => self.complete_answer(question_id, Err(RpcError::UnknownCapability(*id))),
            },
            WireTarget::PromisedAnswer {
                question_id: target_answer,
                transform,
            } => match self.answers.get_mut(*target_answer) {
                None => self.complete_answer(
                    question_id,
                    Err(RpcError::PromiseBroken(format!(
                        "promised answer {target_answer} is unknown"
                    ))),
                ),
                Some(entry) => match &entry.state {
                    AnswerState::Ready(Ok(payload)) => {
                        let payload = payload.clone();
                        match payload.resolve_transform(transform) {
                            Ok(cap) => self.dispatch_answer(
                                question_id,
                                cap,
                                interface_id,
                                method_id,
                                params,
                            ),
                            Err(e) => self.complete_answer(question_id, Err(e)),
                        }
                    }
                    AnswerState::Ready(Err(e)) => {
                        let broken = RpcError::PromiseBroken(e.to_string());
                        self.complete_answer(question_id, Err(broken));
                    }
                    AnswerState::Pending => entry.queued_calls.push(QueuedInboundCall {
                        answer_id: question_id,
                        transform: transform.clone(),
                        interface_id,
                        method_id,
                        params,
                    }),
                },
            },
        }
    }

    /// Routes an inbound call to the local object behind `cap`.
    fn dispatch_answer(
        &mut self,
        answer_id: AnswerId,
        cap: Capability,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) {
        let mut cap = cap;
        while let Capability::Exported { id } = cap {
            match self.exports.get(id) {
                Some(entry) => cap = entry.cap.clone(),
                None => {
                    self.complete_answer(answer_id, Err(RpcError::UnknownCapability(id)));
                    return;
                }
            }
        }
        match cap {
            Capability::Local { id } => match self.locals.get(id) {
                Some(dispatcher) => {
                    let vat = self.self_handle.clone();
                    tokio::spawn(async move {
                        let outcome = dispatcher
                            .dispatch(interface_id, method_id, params, vat.clone())
                            .await;
                        vat.post(VatEvent::AnswerReady { answer_id, outcome });
                    });
                }
                None => self.complete_answer(answer_id, Err(RpcError::UnknownCapability(id))),
            },
            Capability::Promise {
                variant: PromiseVariant::Answer,
                id: target_answer,
                transform,
            } => {
                // the promised answer resolved to yet another promise
                match self.answers.get_mut(target_answer) {
                    Some(entry) if matches!(entry.state, AnswerState::Pending) => {
                        entry.queued_calls.push(QueuedInboundCall {
                            answer_id,
                            transform,
                            interface_id,
                            method_id,
                            params,
                        });
                    }
                    _ => self.complete_answer(
                        answer_id,
                        Err(RpcError::PromiseBroken(format!(
                            "promised answer {target_answer} cannot be chained"
                        ))),
                    ),
                }
            }
            other => self.complete_answer(
                answer_id,
                Err(rpc_usage_err!(
                    "call target {other:?} is not hosted by this vat"
                )),
            ),
        }
    }

    /// Finishes an inbound call: sends the return, records the sent
    /// exports, releases the param imports, and wakes pipelined calls.
    fn complete_answer(&mut self, answer_id: AnswerId, outcome: Outcome) {
        if self.state == SessionState::Stopped {
            self.answers.remove(answer_id);
            return;
        }
        let released = match self.answers.get_mut(answer_id) {
            Some(entry) => entry.released,
            None => {
                debug!("outcome for unknown answer {answer_id}");
                return;
            }
        };

        if released {
            // finish won the race; confirm the cancellation
            let Some(entry) = self.answers.remove(answer_id) else {
                return;
            };
            for id in entry.param_imports {
                self.imports.release(id, 1);
            }
            let built =
                message::build_return_canceled(self.config.first_segment_words(), answer_id);
            if let Ok(bytes) = built {
                let _ = self.send_frame(&bytes);
            }
            self.fail_queued(entry.queued_calls, entry.queued_local_calls, answer_id);
            return;
        }

        // serialize the return before touching the entry again
        let first_words = self.config.first_segment_words();
        let (send_result, sent_exports) = match &outcome {
            Ok(payload) => {
                let (descriptors, sent_exports) = self.translate_caps_out(&payload.caps);
                let built = message::build_return_results(
                    first_words,
                    answer_id,
                    true,
                    &payload.content,
                    &descriptors,
                );
                (built.and_then(|bytes| self.send_frame(&bytes)), sent_exports)
            }
            Err(e) => {
                let built = message::build_return_exception(first_words, answer_id, &e.reason());
                (built.and_then(|bytes| self.send_frame(&bytes)), Vec::new())
            }
        };
        if let Err(e) = send_result {
            warn!("sending return for answer {answer_id} failed: {e}");
            self.answers.remove(answer_id);
            return;
        }

        let Some(entry) = self.answers.get_mut(answer_id) else {
            return;
        };
        entry.sent_exports = sent_exports;
        let param_imports: Vec<ImportId> = entry.param_imports.drain(..).collect();
        let queued: Vec<QueuedInboundCall> = entry.queued_calls.drain(..).collect();
        let queued_local: Vec<QueuedCall> = entry.queued_local_calls.drain(..).collect();
        let queue_outcome = duplicate_outcome(&outcome);
        entry.state = AnswerState::Ready(outcome);

        // returning with releaseParamCaps drops our param import refs
        for id in param_imports {
            self.imports.release(id, 1);
        }
        for call in queued {
            match &queue_outcome {
                Ok(payload) => match payload.resolve_transform(&call.transform) {
                    Ok(cap) => self.dispatch_answer(
                        call.answer_id,
                        cap,
                        call.interface_id,
                        call.method_id,
                        call.params,
                    ),
                    Err(e) => self.complete_answer(call.answer_id, Err(e)),
                },
                Err(e) => self.complete_answer(
                    call.answer_id,
                    Err(RpcError::PromiseBroken(e.to_string())),
                ),
            }
        }
        for call in queued_local {
            self.run_queued_call(call, &queue_outcome);
        }
    }

    fn fail_queued(
        &mut self,
        queued: Vec<QueuedInboundCall>,
        queued_local: Vec<QueuedCall>,
        answer_id: AnswerId,
    ) {
        for call in queued {
            self.complete_answer(
                call.answer_id,
                Err(RpcError::PromiseBroken(format!(
                    "answer {answer_id} was canceled"
                ))),
            );
        }
        for call in queued_local {
            self.fulfill_question(
                call.question_id,
                Err(RpcError::PromiseBroken(format!(
                    "answer {answer_id} was canceled"
                ))),
                Vec::new(),
            );
        }
    }

    fn handle_return(
        &mut self,
        answer_id: QuestionId,
        release_param_caps: bool,
        body: WireReturn,
    ) {
        let Some(entry) = self.questions.get_mut(answer_id) else {
            // expected after we cancelled with an early finish
            debug!("return for unknown question {answer_id}");
            return;
        };
        let param_exports: Vec<ExportId> = if release_param_caps {
            entry.param_exports.drain(..).collect()
        } else {
            Vec::new()
        };
        for id in param_exports {
            self.exports.release(id, Some(1));
        }

        let (outcome, result_imports) = match body {
            WireReturn::Results(payload) => {
                let (caps, imports) = self.translate_caps_in(&payload.cap_table);
                (
                    Ok(Payload {
                        content: payload.root,
                        caps,
                    }),
                    imports,
                )
            }
            WireReturn::Exception(reason) => (Err(RpcError::Peer(reason)), Vec::new()),
            WireReturn::Canceled => (Err(RpcError::Canceled), Vec::new()),
        };
        self.fulfill_question(answer_id, outcome, result_imports);
    }

    fn handle_finish(&mut self, question_id: AnswerId, release_result_caps: bool) {
        match self.answers.get_mut(question_id) {
            None => {
                debug!("finish for unknown answer {question_id}");
                return;
            }
            Some(entry) => {
                if matches!(entry.state, AnswerState::Pending) {
                    // cancellation; the worker's completion turns into canceled
                    entry.released = true;
                    return;
                }
            }
        }
        let Some(entry) = self.answers.remove(question_id) else {
            return;
        };
        if release_result_caps {
            for id in entry.sent_exports {
                self.exports.release(id, Some(1));
            }
        }
    }

    fn handle_restore(&mut self, question_id: AnswerId, object_id: &str) {
        self.stats.calls_received += 1;
        if !self.answers.insert(question_id, AnswerEntry::new(Vec::new())) {
            warn!("peer reused live answer id {question_id} for restore");
            return;
        }
        let Some(restorer) = self.restorer.clone() else {
            self.complete_answer(
                question_id,
                Err(RpcError::Unimplemented("no restorer configured".to_string())),
            );
            return;
        };
        let vat = self.self_handle.clone();
        let object_id = object_id.to_string();
        tokio::spawn(async move {
            let outcome = match restorer.restore(&object_id, vat.clone()).await {
                Ok(cap) => restored_payload(cap),
                Err(e) => Err(e),
            };
            vat.post(VatEvent::AnswerReady {
                answer_id: question_id,
                outcome,
            });
        });
    }

    // -----------------------------------------------------------
    // cap-table translation
    // -----------------------------------------------------------

    /// Local handles to wire descriptors. Inexpressible handles degrade to
    /// `none` descriptors with a warning rather than failing the message.
    fn translate_caps_out(
        &mut self,
        caps: &[Capability],
    ) -> (Vec<WireCapDescriptor>, Vec<ExportId>) {
        let mut descriptors = Vec::with_capacity(caps.len());
        let mut exported = Vec::new();
        for cap in caps {
            let descriptor = match cap {
                Capability::Local { .. } => {
                    let id = self.exports.export(cap.clone());
                    exported.push(id);
                    WireCapDescriptor::SenderHosted(id)
                }
                Capability::Exported { id } => {
                    if self.exports.retain(*id) {
                        exported.push(*id);
                        WireCapDescriptor::SenderHosted(*id)
                    } else {
                        warn!("outbound payload references dead export {id}");
                        WireCapDescriptor::None
                    }
                }
                Capability::Remote { id } => WireCapDescriptor::ReceiverHosted(*id),
                Capability::Promise {
                    variant: PromiseVariant::Remote,
                    id,
                    transform,
                } => WireCapDescriptor::ReceiverAnswer {
                    question_id: *id,
                    transform: transform.clone(),
                },
                Capability::Promise { variant, id, .. } => {
                    warn!("promise {id} ({variant:?}) is not expressible on the wire");
                    WireCapDescriptor::None
                }
                Capability::Unsupported => WireCapDescriptor::None,
            };
            descriptors.push(descriptor);
        }
        (descriptors, exported)
    }

    /// Wire descriptors to local handles, retaining imports.
    fn translate_caps_in(
        &mut self,
        descriptors: &[WireCapDescriptor],
    ) -> (Vec<Capability>, Vec<ImportId>) {
        let mut caps = Vec::with_capacity(descriptors.len());
        let mut retained = Vec::new();
        for descriptor in descriptors {
            let cap = match descriptor {
                WireCapDescriptor::None => Capability::Unsupported,
                WireCapDescriptor::SenderHosted(id) => {
                    self.imports.retain(*id);
                    retained.push(*id);
                    Capability::Remote { id: *id }
                }
                WireCapDescriptor::SenderPromise(id) => {
                    self.imports.retain(*id);
                    retained.push(*id);
                    Capability::Promise {
                        id: *id,
                        variant: PromiseVariant::Resolve,
                        transform: Vec::new(),
                    }
                }
                WireCapDescriptor::ReceiverHosted(id) => Capability::Exported { id: *id },
                WireCapDescriptor::ReceiverAnswer {
                    question_id,
                    transform,
                } => Capability::Promise {
                    id: *question_id,
                    variant: PromiseVariant::Answer,
                    transform: transform.clone(),
                },
                WireCapDescriptor::ThirdPartyHosted => {
                    warn!("thirdPartyHosted descriptor recorded as unsupported");
                    Capability::Unsupported
                }
            };
            caps.push(cap);
        }
        (caps, retained)
    }

    // -----------------------------------------------------------
    // transport and teardown
    // -----------------------------------------------------------

    fn send_frame(&mut self, bytes: &[u8]) -> RpcResult<()> {
        match self.transport.send(bytes) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                Ok(())
            }
            Err(e) => {
                error!("transport send failed: {e}");
                self.fail_session(&RpcError::TransportFailed);
                Err(RpcError::TransportFailed)
            }
        }
    }

    /// Terminal: every outstanding question fails, the tables empty.
    fn fail_session(&mut self, error: &RpcError) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = SessionState::Stopped;
        info!("session stopped: {error}");
        for (question_id, entry) in self.questions.drain() {
            trace!("failing question {question_id}");
            for waiter in entry.waiters {
                let _ = waiter.send(Err(error.duplicate()));
            }
            for queued in entry.queued_calls {
                // their questions were drained too; waiters already failed
                trace!("dropping queued call on question {}", queued.question_id);
            }
        }
    }
}

/// Wraps a restored capability into the conventional result payload.
fn restored_payload(cap: Capability) -> Outcome {
    let (mut payload, object) = Payload::build(schema::restored::SIZE)?;
    let index = payload.add_cap(cap);
    object.set_cap_index(&schema::restored::CAP, index)?;
    Ok(payload)
}
