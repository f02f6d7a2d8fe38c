// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! One end of an RPC connection: the state machine that owns the question,
//! answer, export, and import tables and turns protocol messages into table
//! mutations and outbound frames.
//!
//! The peer is sans-IO and single-threaded. Bytes come in through
//! [Peer::push_bytes] (or whole frames through [Peer::handle_frame]); frames
//! go out through the [Transport]; everything user-visible is surfaced
//! through [Peer::poll_event] and answered through [Peer::post_result]. The
//! peer never calls user code while its own tables are mid-mutation.

use std::collections::HashMap;
use std::rc::Rc;

use capstan::message::{self, ReaderOptions};
use capstan::serialize::{self, FrameLimits, Framer, OwnedSegments};
use capstan::{Error, ErrorKind, Result};

use crate::cap_table::{EffectTables, OutboundCapEffects, StagedEffect};
use crate::call_queue::CallQueue;
use crate::pipeline::Transform;
use crate::proto::{
    accept, call, cap_descriptor, disembargo, exception, finish, join, message as rpc_message,
    message_target, payload, provide, release, resolve, return_,
};
use crate::tables::{ExportTable, ImportTable};
use crate::transport::Transport;

pub type QuestionId = u32;
pub type AnswerId = u32;
pub type ExportId = u32;
pub type ImportId = u32;
pub type EmbargoId = u32;

/// Index into the embedder's server registry. The peer never holds server
/// objects itself; it routes calls to these slots.
pub type ServerId = u32;

/// A capability, as referenced from payloads and call targets on this
/// connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapRef {
    /// A null capability.
    None,

    /// A server hosted in this vat, not necessarily exported yet.
    LocalServer(ServerId),

    /// An entry in our export table (something we host that the peer
    /// references).
    Export(ExportId),

    /// An entry in our import table (something the peer hosts).
    Import(ImportId),

    /// The eventual result (or a field thereof) of one of our outstanding
    /// questions.
    PromisedAnswer {
        question_id: QuestionId,
        transform: Transform,
    },

    /// A capability hosted by a third party, received in a payload. `vine`
    /// proxies through the sender until an Accept on the third-party
    /// connection completes.
    ThirdParty {
        third_party_id: Vec<u8>,
        vine: ImportId,
    },

    /// A capability hosted by a third party, to be sent in a payload. The
    /// vine is a local proxy server that forwards calls until the recipient
    /// accepts.
    ThirdPartyHosted {
        third_party_id: Vec<u8>,
        vine: ServerId,
    },

    /// A capability that failed to resolve.
    Broken,
}

/// Where an outbound call's results should be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultsTo {
    Caller,
    /// Tail-call: the callee keeps the results and returns
    /// `resultsSentElsewhere`; we will point another answer at them with
    /// `takeFromOtherQuestion`.
    Yourself,
    /// The callee hands results to a third party keyed by this completion
    /// key.
    ThirdParty(Vec<u8>),
}

/// A set of parameters or results being assembled for transmission: message
/// content plus the capabilities it references, by index.
pub struct PayloadBuilder {
    message: message::Builder,
    caps: Vec<CapRef>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self {
            message: message::Builder::new_default(),
            caps: Vec::new(),
        }
    }

    /// The payload's content root.
    pub fn content(&mut self) -> capstan::any_pointer::Builder<'_> {
        self.message
            .get_root()
            .expect("payload root is always readable")
    }

    /// Registers a capability and returns its cap-table index, to be written
    /// into a capability pointer within the content.
    pub fn add_cap(&mut self, cap: CapRef) -> u32 {
        self.caps.push(cap);
        (self.caps.len() - 1) as u32
    }

    /// Makes the content a single capability.
    pub fn set_cap(&mut self, cap: CapRef) {
        let index = self.add_cap(cap);
        self.content().set_capability_index(index);
    }

    pub fn caps(&self) -> &[CapRef] {
        &self.caps
    }

    /// Reads a complete frame whose root is the content value.
    pub fn from_content_bytes(bytes: &[u8], options: ReaderOptions) -> Result<Self> {
        let reader = serialize::read_message_from_flat_slice(bytes, options)?;
        let mut this = Self::new();
        let root: capstan::any_pointer::Reader = reader.get_root()?;
        this.content().set_as(root)?;
        Ok(this)
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
enum PayloadSlot {
    CallParams,
    ReturnResults,
}

#[derive(Clone, Debug)]
enum PayloadInner {
    Frame {
        frame: Rc<message::Reader<OwnedSegments>>,
        slot: PayloadSlot,
    },
    Local {
        message: Rc<message::Builder>,
    },
}

/// A received (or locally retained) set of parameters or results.
#[derive(Clone, Debug)]
pub struct Payload {
    inner: PayloadInner,
    caps: Vec<CapRef>,
}

impl Payload {
    fn from_frame(
        frame: Rc<message::Reader<OwnedSegments>>,
        slot: PayloadSlot,
        caps: Vec<CapRef>,
    ) -> Self {
        Self {
            inner: PayloadInner::Frame { frame, slot },
            caps,
        }
    }

    fn from_builder(builder: PayloadBuilder) -> Self {
        Self {
            inner: PayloadInner::Local {
                message: Rc::new(builder.message),
            },
            caps: builder.caps,
        }
    }

    /// The payload's content root.
    pub fn content(&self) -> Result<capstan::any_pointer::Reader<'_>> {
        match &self.inner {
            PayloadInner::Local { message } => message.get_root_as_reader(),
            PayloadInner::Frame { frame, slot } => {
                let root: rpc_message::Reader = frame.get_root()?;
                let payload = match (slot, root.which()?) {
                    (PayloadSlot::CallParams, rpc_message::Which::Call(c)) => c?.get_params()?,
                    (PayloadSlot::ReturnResults, rpc_message::Which::Return(r)) => {
                        match r?.which()? {
                            return_::Which::Results(p) => p?,
                            _ => {
                                return Err(Error::from_kind(ErrorKind::ProtocolViolation)
                                    .context("return does not carry results".into()))
                            }
                        }
                    }
                    _ => {
                        return Err(Error::from_kind(ErrorKind::ProtocolViolation)
                            .context("frame does not carry the expected payload".into()))
                    }
                };
                Ok(payload.get_content())
            }
        }
    }

    /// The capabilities attached to this payload, in cap-table order.
    pub fn caps(&self) -> &[CapRef] {
        &self.caps
    }

    /// Looks up the capability behind a capability pointer within the
    /// content.
    pub fn cap_at(&self, pointer: capstan::any_pointer::Reader<'_>) -> Result<CapRef> {
        let index = pointer.get_capability_index()?;
        self.caps
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                Error::from_kind(ErrorKind::ProtocolViolation)
                    .context(format!("capability index {index} is outside the cap table"))
            })
    }

    /// Convenience for payloads whose content is a single capability.
    pub fn single_cap(&self) -> Result<CapRef> {
        self.cap_at(self.content()?)
    }

    /// Resolves a transform against this payload.
    fn transformed_cap(&self, transform: &Transform) -> Result<CapRef> {
        let index = transform.resolve_capability(self.content()?)?;
        self.caps.get(index as usize).cloned().ok_or_else(|| {
            Error::from_kind(ErrorKind::ProtocolViolation)
                .context(format!("capability index {index} is outside the cap table"))
        })
    }

    /// Deep-copies into a fresh builder, preserving the cap list. Used when
    /// forwarding a payload onward.
    pub fn to_builder(&self) -> Result<PayloadBuilder> {
        let mut builder = PayloadBuilder::new();
        builder.content().set_as(self.content()?)?;
        builder.caps = self.caps.clone();
        Ok(builder)
    }
}

/// What the embedder sees happening on the connection.
pub enum Event {
    /// An inbound call landed on a locally hosted server. Answer with
    /// [Peer::post_result].
    IncomingCall {
        answer_id: AnswerId,
        server: ServerId,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    },

    /// One of our outbound calls resolved to a locally hosted server (after
    /// a promise resolution looped back). Answer with
    /// [Peer::post_loopback_result].
    LoopbackCall {
        question_id: QuestionId,
        server: ServerId,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    },

    /// An outbound question completed.
    Returned {
        question_id: QuestionId,
        result: Result<Payload>,
    },

    /// An import settled (possibly to a broken state).
    Resolved { import_id: ImportId },

    /// The connection died.
    Aborted { error: Error },
}

enum QuestionPurpose {
    UserCall,
    Bootstrap,
    /// Results feed the Return of one of our answers (reflected or
    /// forwarded call).
    Forwarded { answer_id: AnswerId },
    Provide,
    Accept,
    Join,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QuestionState {
    Waiting,
    Returned,
    /// Return said `resultsSentElsewhere`; completion arrives through
    /// another channel.
    ResultsElsewhere,
}

struct Question {
    purpose: QuestionPurpose,
    state: QuestionState,
    finish_sent: bool,
    /// Exports referenced by this call's params; released when the Return
    /// carries `releaseParamCaps`.
    param_exports: Vec<ExportId>,
    /// Imports obtained from the Return; released by our Finish when
    /// `releaseResultCaps` is set.
    result_imports: Vec<ImportId>,
}

enum AnswerState {
    /// In the embedder's (or a forward's) hands.
    Dispatched,
    /// Pipelined call parked on another answer's results.
    QueuedOnAnswer { parent: AnswerId, ticket: u64 },
    /// Call parked on an unresolved promise export.
    QueuedOnExport { parent: ExportId, ticket: u64 },
    /// Return sent (or results retained for elsewhere-delivery).
    Returned,
}

struct Answer {
    state: AnswerState,
    results_to: ResultsTo,
    /// Imports that arrived in the call's params.
    param_imports: Vec<ImportId>,
    /// Exports referenced by our Return's results.
    result_exports: Vec<ExportId>,
    /// Pipelined calls parked on this answer.
    queued: CallQueue<QueuedCall>,
    /// Result payload retained for late pipelined calls and
    /// `takeFromOtherQuestion`.
    retained: Option<Payload>,
    /// Set when the answer completed with an exception, so late pipelined
    /// calls inherit it.
    outcome_error: Option<Error>,
    finish_received: bool,
    /// For a Provide answer: the completion key, so the provision unwinds
    /// when the introducer finishes the question.
    provision_key: Option<Vec<u8>>,
}

impl Answer {
    fn new(results_to: ResultsTo) -> Self {
        Self {
            state: AnswerState::Dispatched,
            results_to,
            param_imports: Vec::new(),
            result_exports: Vec::new(),
            queued: CallQueue::new(),
            retained: None,
            outcome_error: None,
            finish_received: false,
            provision_key: None,
        }
    }
}

struct QueuedCall {
    answer_id: AnswerId,
    interface_id: u64,
    method_id: u16,
    params: Payload,
    transform: Transform,
}

enum ExportTarget {
    Local(ServerId),
    Promise {
        resolved: Option<Result<CapRef>>,
        advertised: bool,
        queued: CallQueue<QueuedCall>,
    },
}

struct Export {
    ref_count: u32,
    target: ExportTarget,
}

enum ImportState {
    /// A settled capability.
    Settled,
    /// A promise awaiting Resolve.
    Promise { calls_sent: bool },
    /// Resolved; while `embargo` is pending, new calls queue locally.
    Resolved {
        cap: Result<CapRef>,
        embargo: Option<EmbargoId>,
    },
}

struct Import {
    ref_count: u32,
    state: ImportState,
}

struct Embargo {
    import_id: ImportId,
    queued: Vec<EmbargoedCall>,
}

struct EmbargoedCall {
    question_id: QuestionId,
    interface_id: u64,
    method_id: u16,
    params: PayloadBuilder,
    results_to: ResultsTo,
}

/// Completed provisions, keyed by completion key. The table belongs to the
/// vat, not to one connection: a Provide arrives from the introducer while
/// the matching Accept arrives from the recipient, usually on different
/// connections. Every peer of the vat shares one of these.
#[derive(Default)]
pub struct ProvisionMap {
    provided: HashMap<Vec<u8>, ServerId>,
}

impl ProvisionMap {
    pub fn len(&self) -> usize {
        self.provided.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provided.is_empty()
    }
}

pub type SharedProvisions = Rc<std::cell::RefCell<ProvisionMap>>;

struct JoinState {
    part_count: u16,
    /// part_num -> (answer id, resolved target)
    parts: HashMap<u16, (AnswerId, CapRef)>,
}

/// Connection-level configuration.
#[derive(Clone, Copy, Debug)]
pub struct PeerOptions {
    pub reader_options: ReaderOptions,
    pub frame_limits: FrameLimits,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            reader_options: ReaderOptions::default(),
            frame_limits: FrameLimits::default(),
        }
    }
}

/// One end of an RPC connection.
pub struct Peer {
    options: PeerOptions,
    transport: Box<dyn Transport>,
    framer: Framer,

    questions: ExportTable<Question>,
    answers: ImportTable<Answer>,
    exports: ExportTable<Export>,
    imports: ImportTable<Import>,
    embargoes: ExportTable<Embargo>,

    /// Vat-level provision table, shared between this vat's peers.
    shared_provisions: SharedProvisions,
    /// Accepts that arrived before their Provide, parked per key.
    pending_accepts: HashMap<Vec<u8>, Vec<AnswerId>>,
    /// Retained results awaiting redemption (`sendResultsTo.thirdParty`).
    results_provisions: HashMap<Vec<u8>, AnswerId>,
    joins: HashMap<u32, JoinState>,

    /// Dedup: one export id per local server slot.
    exports_by_server: HashMap<ServerId, ExportId>,

    bootstrap_server: Option<ServerId>,
    events: std::collections::VecDeque<Event>,
    on_error: Option<Box<dyn FnOnce(&Error)>>,
    close_requested: bool,
    closed: Option<Error>,
    unimplemented_received: u32,
}

impl Peer {
    pub fn new(transport: Box<dyn Transport>, options: PeerOptions) -> Self {
        Self {
            framer: Framer::new(options.reader_options, options.frame_limits),
            options,
            transport,
            questions: ExportTable::new(),
            answers: ImportTable::new(),
            exports: ExportTable::new(),
            imports: ImportTable::new(),
            embargoes: ExportTable::new(),
            shared_provisions: SharedProvisions::default(),
            pending_accepts: HashMap::new(),
            results_provisions: HashMap::new(),
            joins: HashMap::new(),
            exports_by_server: HashMap::new(),
            bootstrap_server: None,
            events: std::collections::VecDeque::new(),
            on_error: None,
            close_requested: false,
            closed: None,
            unimplemented_received: 0,
        }
    }

    /// Registers the server slot answering Bootstrap messages.
    pub fn set_bootstrap(&mut self, server: ServerId) {
        self.bootstrap_server = Some(server);
    }

    /// Joins this peer to a vat-level provision table, so Provides received
    /// on one connection can satisfy Accepts received on another.
    pub fn set_shared_provisions(&mut self, shared: SharedProvisions) {
        self.shared_provisions = shared;
    }

    /// Completes any parked Accepts whose provision has since arrived on
    /// another of the vat's connections. The embedder calls this after
    /// pumping the connection that received the Provide.
    pub fn redeem_pending_accepts(&mut self) -> Result<()> {
        let keys: Vec<Vec<u8>> = self.pending_accepts.keys().cloned().collect();
        for key in keys {
            let server = self.shared_provisions.borrow().provided.get(&key).copied();
            if let Some(server) = server {
                if let Some(answers) = self.pending_accepts.remove(&key) {
                    for answer_id in answers {
                        self.complete_accept(answer_id, CapRef::LocalServer(server))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Registers the callback fired exactly once when the connection dies.
    pub fn set_on_error(&mut self, callback: Box<dyn FnOnce(&Error)>) {
        self.on_error = Some(callback);
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // -- introspection, mostly for embedders and tests --------------------

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn export_ref_count(&self, id: ExportId) -> Option<u32> {
        self.exports.get(id).map(|e| e.ref_count)
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }

    pub fn has_answer(&self, id: AnswerId) -> bool {
        self.answers.contains(id)
    }

    pub fn provision_count(&self) -> usize {
        self.shared_provisions.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// How many messages the peer has reported not understanding.
    pub fn unimplemented_count(&self) -> u32 {
        self.unimplemented_received
    }

    fn check_open(&self) -> Result<()> {
        match &self.closed {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    // -- outbound operations ----------------------------------------------

    /// Asks the peer for its bootstrap capability.
    pub fn send_bootstrap(&mut self) -> Result<QuestionId> {
        self.check_open()?;
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::Bootstrap,
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut bootstrap = root.init_bootstrap();
            bootstrap.set_question_id(question_id);
        }
        match self.send_message(builder, OutboundCapEffects::new()) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.erase(question_id);
                Err(e)
            }
        }
    }

    /// Sends a call. The target must be remote (an import or a promised
    /// answer); calls that resolve to local servers surface as
    /// [Event::LoopbackCall].
    pub fn send_call(
        &mut self,
        target: &CapRef,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
    ) -> Result<QuestionId> {
        self.send_call_with_results_to(target, interface_id, method_id, params, ResultsTo::Caller)
    }

    pub fn send_call_with_results_to(
        &mut self,
        target: &CapRef,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
        results_to: ResultsTo,
    ) -> Result<QuestionId> {
        self.check_open()?;
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::UserCall,
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        match self.dispatch_outbound_call(
            question_id,
            target.clone(),
            interface_id,
            method_id,
            params,
            results_to,
        ) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.erase(question_id);
                Err(e)
            }
        }
    }

    /// Routes an outbound call for an already-allocated question: to the
    /// wire, to an embargo queue, or back to a local server.
    fn dispatch_outbound_call(
        &mut self,
        question_id: QuestionId,
        target: CapRef,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
        results_to: ResultsTo,
    ) -> Result<()> {
        match self.resolve_capref(target) {
            CapRef::Import(import_id) => {
                if let Some(Import {
                    state: ImportState::Resolved { cap: Err(e), .. },
                    ..
                }) = self.imports.get(import_id)
                {
                    return Err(e.clone());
                }
                if let Some(embargo_id) = self.pending_embargo_for(import_id) {
                    let embargo = self
                        .embargoes
                        .get_mut(embargo_id)
                        .expect("pending embargo exists");
                    embargo.queued.push(EmbargoedCall {
                        question_id,
                        interface_id,
                        method_id,
                        params,
                        results_to,
                    });
                    return Ok(());
                }
                if let Some(import) = self.imports.get_mut(import_id) {
                    if let ImportState::Promise { calls_sent } = &mut import.state {
                        *calls_sent = true;
                    }
                }
                self.send_wire_call(
                    question_id,
                    WireTarget::ImportedCap(import_id),
                    interface_id,
                    method_id,
                    params,
                    results_to,
                )
            }
            CapRef::PromisedAnswer {
                question_id: pipelined_on,
                transform,
            } => self.send_wire_call(
                question_id,
                WireTarget::PromisedAnswer {
                    question_id: pipelined_on,
                    transform,
                },
                interface_id,
                method_id,
                params,
                results_to,
            ),
            CapRef::ThirdParty { vine, .. } => self.send_wire_call(
                question_id,
                WireTarget::ImportedCap(vine),
                interface_id,
                method_id,
                params,
                results_to,
            ),
            CapRef::LocalServer(server) => {
                self.events.push_back(Event::LoopbackCall {
                    question_id,
                    server,
                    interface_id,
                    method_id,
                    params: Payload::from_builder(params),
                });
                Ok(())
            }
            CapRef::Export(export_id) => match self.exports.get(export_id) {
                Some(Export {
                    target: ExportTarget::Local(server),
                    ..
                }) => {
                    let server = *server;
                    self.events.push_back(Event::LoopbackCall {
                        question_id,
                        server,
                        interface_id,
                        method_id,
                        params: Payload::from_builder(params),
                    });
                    Ok(())
                }
                _ => Err(Error::from_kind(ErrorKind::CapabilityUnavailable)
                    .context("call target is an unresolved promise export".into())),
            },
            CapRef::None | CapRef::Broken | CapRef::ThirdPartyHosted { .. } => {
                Err(Error::from_kind(ErrorKind::CapabilityUnavailable)
                    .context("call target is not callable".into()))
            }
        }
    }

    fn send_wire_call(
        &mut self,
        question_id: QuestionId,
        target: WireTarget,
        interface_id: u64,
        method_id: u16,
        params: PayloadBuilder,
        results_to: ResultsTo,
    ) -> Result<()> {
        let mut builder = message::Builder::new_default();
        let mut effects = OutboundCapEffects::new();
        let mut export_ids = Vec::new();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut call = root.init_call();
            call.set_question_id(question_id);
            call.set_interface_id(interface_id);
            call.set_method_id(method_id);
            {
                let mut target_builder = call.init_target();
                match &target {
                    WireTarget::ImportedCap(id) => target_builder.set_imported_cap(*id),
                    WireTarget::PromisedAnswer {
                        question_id,
                        transform,
                    } => {
                        let mut promised = target_builder.init_promised_answer();
                        promised.set_question_id(*question_id);
                        transform.write_to(promised);
                    }
                }
            }
            match &results_to {
                ResultsTo::Caller => call.set_send_results_to_caller(),
                ResultsTo::Yourself => call.set_send_results_to_yourself(),
                ResultsTo::ThirdParty(key) => {
                    call.init_send_results_to_third_party().set_as(&key[..])?;
                }
            }
            let mut payload = call.init_params();
            payload.get_content().set_as(params.message.get_root_as_reader::<capstan::any_pointer::Reader>()?)?;
            self.encode_cap_table(&params.caps, &mut payload, &mut effects, &mut export_ids)?;
        }
        match self.send_message(builder, effects) {
            Ok(()) => {
                if let Some(question) = self.questions.get_mut(question_id) {
                    question.param_exports = export_ids;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Closes one of our questions. `release_result_caps` drops the imports
    /// the Return carried without separate Release messages.
    pub fn send_finish(&mut self, question_id: QuestionId, release_result_caps: bool) -> Result<()> {
        self.send_finish_with_workaround(question_id, release_result_caps, false)
    }

    pub fn send_finish_with_workaround(
        &mut self,
        question_id: QuestionId,
        release_result_caps: bool,
        require_early_cancellation_workaround: bool,
    ) -> Result<()> {
        self.check_open()?;
        {
            let question = self
                .questions
                .get(question_id)
                .ok_or_else(|| protocol_violation("finish for unknown question"))?;
            if question.finish_sent {
                return Err(protocol_violation("question already finished"));
            }
        }

        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut finish = root.init_finish();
            finish.set_question_id(question_id);
            finish.set_release_result_caps(release_result_caps);
            finish
                .set_require_early_cancellation_workaround(require_early_cancellation_workaround);
        }
        self.send_message(builder, OutboundCapEffects::new())?;

        let result_imports = {
            let question = self
                .questions
                .get_mut(question_id)
                .expect("question checked above");
            question.finish_sent = true;
            if release_result_caps {
                std::mem::take(&mut question.result_imports)
            } else {
                Vec::new()
            }
        };
        for import_id in result_imports {
            self.release_import_local(import_id, 1);
        }
        self.maybe_release_question(question_id);
        Ok(())
    }

    /// Drops `count` references to an import, notifying the peer.
    pub fn send_release(&mut self, import_id: ImportId, count: u32) -> Result<()> {
        self.check_open()?;
        if !self.imports.contains(import_id) {
            return Err(protocol_violation("release of unknown import"));
        }
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut release = root.init_release();
            release.set_id(import_id);
            release.set_reference_count(count);
        }
        self.send_message(builder, OutboundCapEffects::new())?;
        self.release_import_local(import_id, count);
        Ok(())
    }

    /// Creates a promise export that can be handed out in payloads and
    /// settled later with [Peer::send_resolve].
    pub fn new_promise_export(&mut self) -> ExportId {
        self.exports.push(Export {
            ref_count: 0,
            target: ExportTarget::Promise {
                resolved: None,
                advertised: false,
                queued: CallQueue::new(),
            },
        })
    }

    /// Settles one of our promise exports. The Resolve message only goes on
    /// the wire if the promise has actually been advertised to the peer;
    /// otherwise the peer has no import to resolve.
    pub fn send_resolve(&mut self, export_id: ExportId, resolution: Result<CapRef>) -> Result<()> {
        self.check_open()?;
        let advertised = match self.exports.get(export_id) {
            Some(Export {
                target:
                    ExportTarget::Promise {
                        resolved: None,
                        advertised,
                        ..
                    },
                ..
            }) => *advertised,
            Some(_) => return Err(protocol_violation("resolve of a settled export")),
            None => return Err(protocol_violation("resolve of unknown export")),
        };

        if advertised {
            let mut effects = OutboundCapEffects::new();
            let mut builder = message::Builder::new_default();
            {
                let root = builder.init_root::<rpc_message::Builder>();
                let mut resolve = root.init_resolve();
                resolve.set_promise_id(export_id);
                match &resolution {
                    Ok(cap) => {
                        let mut descriptor = resolve.init_cap();
                        self.encode_cap(cap, &mut descriptor, &mut effects, &mut Vec::new())?;
                    }
                    Err(error) => {
                        let mut exc = resolve.init_exception();
                        write_exception(&mut exc, error)?;
                    }
                }
            }
            self.send_message(builder, effects)?;
        }

        let queued = {
            let export = self
                .exports
                .get_mut(export_id)
                .expect("export checked above");
            match &mut export.target {
                ExportTarget::Promise {
                    resolved, queued, ..
                } => {
                    *resolved = Some(resolution.clone());
                    queued.drain().collect::<Vec<_>>()
                }
                ExportTarget::Local(_) => unreachable!("export kind checked above"),
            }
        };
        for call in queued {
            self.redispatch_queued(call, resolution.clone());
        }
        Ok(())
    }

    /// Introducer-side three-party handoff: asks the peer (the provider) to
    /// expect an Accept bearing `completion_key`.
    pub fn send_provide(&mut self, target: &CapRef, completion_key: &[u8]) -> Result<QuestionId> {
        self.check_open()?;
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::Provide,
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut provide = root.init_provide();
            provide.set_question_id(question_id);
            let mut target_builder = provide.init_target();
            self.write_message_target(target, &mut target_builder)?;
            provide.init_recipient().set_as(completion_key)?;
        }
        match self.send_message(builder, OutboundCapEffects::new()) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.erase(question_id);
                Err(e)
            }
        }
    }

    /// Recipient-side three-party handoff: redeems a completion key at the
    /// provider. The accepted capability arrives as this question's result.
    pub fn send_accept(&mut self, completion_key: &[u8], embargo: bool) -> Result<QuestionId> {
        self.check_open()?;
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::Accept,
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut accept = root.init_accept();
            accept.set_question_id(question_id);
            accept.init_provision().set_as(completion_key)?;
            accept.set_embargo(embargo);
        }
        match self.send_message(builder, OutboundCapEffects::new()) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.erase(question_id);
                Err(e)
            }
        }
    }

    /// Sends one part of a join.
    pub fn send_join(
        &mut self,
        target: &CapRef,
        join_id: u32,
        part_count: u16,
        part_num: u16,
    ) -> Result<QuestionId> {
        self.check_open()?;
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::Join,
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut join = root.init_join();
            join.set_question_id(question_id);
            let mut target_builder = join.init_target();
            self.write_message_target(target, &mut target_builder)?;
            let mut key = join.init_key_part();
            key.set_join_id(join_id);
            key.set_part_count(part_count);
            key.set_part_num(part_num);
        }
        match self.send_message(builder, OutboundCapEffects::new()) {
            Ok(()) => Ok(question_id),
            Err(e) => {
                self.questions.erase(question_id);
                Err(e)
            }
        }
    }

    /// Emits a disembargo. Mostly used internally; exposed for embedders
    /// implementing custom embargo flows.
    pub fn send_disembargo(
        &mut self,
        target: &CapRef,
        context: disembargo::WhichContext,
    ) -> Result<()> {
        self.check_open()?;
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut disembargo = root.init_disembargo();
            let mut target_builder = disembargo.init_target();
            self.write_message_target(target, &mut target_builder)?;
            match context {
                disembargo::WhichContext::SenderLoopback(id) => {
                    disembargo.set_context_sender_loopback(id)
                }
                disembargo::WhichContext::ReceiverLoopback(id) => {
                    disembargo.set_context_receiver_loopback(id)
                }
                disembargo::WhichContext::Accept(()) => disembargo.set_context_accept(),
                disembargo::WhichContext::Provide(id) => disembargo.set_context_provide(id),
            }
        }
        self.send_message(builder, OutboundCapEffects::new())
    }

    /// Completes an inbound call. Validates the answer id first, so a host
    /// bridge cannot post into the void.
    pub fn post_result(
        &mut self,
        answer_id: AnswerId,
        result: Result<PayloadBuilder>,
    ) -> Result<()> {
        self.check_open()?;
        let answer = self
            .answers
            .get(answer_id)
            .ok_or_else(|| protocol_violation("post for unknown answer"))?;
        if !matches!(answer.state, AnswerState::Dispatched) {
            return Err(protocol_violation("answer is not awaiting results"));
        }
        match result {
            Ok(payload) => self.answer_with_results(answer_id, payload),
            Err(error) => self.answer_with_exception(answer_id, error),
        }
    }

    /// Completes an answer by pointing the caller at the results of one of
    /// our own questions whose call was sent with [ResultsTo::Yourself]
    /// (`takeFromOtherQuestion`; the tail-call path). The caller holds those
    /// results on its side; we never see them.
    pub fn post_take_from(
        &mut self,
        answer_id: AnswerId,
        other_question_id: QuestionId,
    ) -> Result<()> {
        self.check_open()?;
        match self.questions.get(other_question_id) {
            Some(question) if question.state == QuestionState::ResultsElsewhere => {}
            Some(_) => {
                return Err(protocol_violation(
                    "takeFrom question has not reported results-sent-elsewhere",
                ))
            }
            None => return Err(protocol_violation("takeFrom names an unknown question")),
        }
        if !self.answers.contains(answer_id) {
            return Err(protocol_violation("post for unknown answer"));
        }

        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            ret.set_take_from_other_question(other_question_id);
        }
        self.send_message(builder, OutboundCapEffects::new())?;

        // Pipelined calls parked on this answer chase the other question's
        // pipeline instead.
        let queued = {
            let answer = self
                .answers
                .get_mut(answer_id)
                .expect("answer checked above");
            answer.queued.drain().collect::<Vec<_>>()
        };
        for call in queued {
            if let Some(answer) = self.answers.get_mut(call.answer_id) {
                answer.state = AnswerState::Dispatched;
            }
            let transform = call.transform.clone();
            let outcome = self.forward_inbound_call(
                call.answer_id,
                WireTarget::PromisedAnswer {
                    question_id: other_question_id,
                    transform,
                },
                call.interface_id,
                call.method_id,
                call.params,
            );
            let _ = outcome;
        }
        self.seal_answer(answer_id, None);
        Ok(())
    }

    /// Completes a loopback call (one of our questions that resolved to a
    /// local server).
    pub fn post_loopback_result(
        &mut self,
        question_id: QuestionId,
        result: Result<PayloadBuilder>,
    ) -> Result<()> {
        self.check_open()?;
        if !self.questions.contains(question_id) {
            return Err(protocol_violation("post for unknown question"));
        }
        let result = result.map(Payload::from_builder);
        self.complete_question(question_id, result);
        Ok(())
    }

    // -- inbound ----------------------------------------------------------

    /// Feeds raw connection bytes through the framer.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        if let Err(e) = self.framer.push(bytes) {
            let error = protocol_violation(&format!("framing: {e}"));
            self.send_abort(&error);
            self.abort_with(error.clone());
            return Err(error);
        }
        while let Some(frame) = self.framer.next_message() {
            self.handle_parsed(Rc::new(frame))?;
        }
        Ok(())
    }

    /// Handles one complete frame.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        let reader = serialize::read_message_from_owned_bytes(
            bytes.to_vec(),
            self.options.reader_options,
            self.options.frame_limits,
        )
        .map_err(|e| {
            let error = protocol_violation(&format!("frame decode: {e}"));
            self.send_abort(&error);
            self.abort_with(error.clone());
            error
        })?;
        self.handle_parsed(Rc::new(reader))
    }

    fn handle_parsed(&mut self, frame: Rc<message::Reader<OwnedSegments>>) -> Result<()> {
        let outcome = self.dispatch_frame(&frame);
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if is_fatal_inbound_error(e.kind) => {
                let violation = if e.kind == ErrorKind::ProtocolViolation {
                    e.clone()
                } else {
                    protocol_violation(&format!("malformed message: {e}"))
                };
                self.send_abort(&violation);
                self.abort_with(violation.clone());
                Err(violation)
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch_frame(&mut self, frame: &Rc<message::Reader<OwnedSegments>>) -> Result<()> {
        let root: rpc_message::Reader = frame.get_root()?;
        let which = match root.which() {
            Ok(which) => which,
            Err(_) => {
                // Unknown message type: echo it back as Unimplemented.
                let mut builder = message::Builder::new_default();
                builder
                    .init_root::<rpc_message::Builder>()
                    .set_unimplemented(root)?;
                return self.send_message(builder, OutboundCapEffects::new());
            }
        };
        match which {
            rpc_message::Which::Unimplemented(inner) => self.handle_unimplemented(inner?),
            rpc_message::Which::Abort(exc) => {
                let cause = read_exception(&exc?);
                let error = Error::from_kind(ErrorKind::ConnectionAborted)
                    .context(format!("peer aborted the connection: {cause}"));
                self.abort_with(error.clone());
                Err(error)
            }
            rpc_message::Which::Bootstrap(b) => self.handle_bootstrap(&b?),
            rpc_message::Which::Call(_) => self.handle_call(frame),
            rpc_message::Which::Return(_) => self.handle_return(frame),
            rpc_message::Which::Finish(f) => self.handle_finish(&f?),
            rpc_message::Which::Resolve(r) => self.handle_resolve(&r?),
            rpc_message::Which::Release(r) => self.handle_release(&r?),
            rpc_message::Which::Disembargo(d) => self.handle_disembargo(&d?),
            rpc_message::Which::Provide(p) => self.handle_provide(&p?),
            rpc_message::Which::Accept(a) => self.handle_accept(&a?),
            rpc_message::Which::Join(j) => self.handle_join(&j?),
            rpc_message::Which::ObsoleteSave(_) | rpc_message::Which::ObsoleteDelete(_) => {
                let mut builder = message::Builder::new_default();
                builder
                    .init_root::<rpc_message::Builder>()
                    .set_unimplemented(root)?;
                self.send_message(builder, OutboundCapEffects::new())
            }
        }
    }

    fn handle_unimplemented(&mut self, inner: rpc_message::Reader<'_>) -> Result<()> {
        self.unimplemented_received += 1;
        // A peer that does not understand Resolve never tracked the promise;
        // reconcile by dropping the advertisement locally.
        if let Ok(rpc_message::Which::Resolve(Ok(resolve))) = inner.which() {
            let export_id = resolve.get_promise_id();
            if let Some(Export {
                target: ExportTarget::Promise { advertised, .. },
                ..
            }) = self.exports.get_mut(export_id)
            {
                *advertised = false;
            }
        }
        Ok(())
    }

    fn handle_bootstrap(&mut self, bootstrap: &crate::proto::bootstrap::Reader<'_>) -> Result<()> {
        let answer_id = bootstrap.get_question_id();
        if self.answers.contains(answer_id) {
            return Err(protocol_violation("duplicate question id"));
        }
        self.answers.insert(answer_id, Answer::new(ResultsTo::Caller));
        match self.bootstrap_server {
            Some(server) => {
                let mut payload = PayloadBuilder::new();
                payload.set_cap(CapRef::LocalServer(server));
                self.answer_with_results(answer_id, payload)
            }
            None => self.answer_with_exception(
                answer_id,
                Error::failed("no bootstrap capability is configured".into()),
            ),
        }
    }

    fn handle_call(&mut self, frame: &Rc<message::Reader<OwnedSegments>>) -> Result<()> {
        let (answer_id, interface_id, method_id, results_to, target, transform_target, caps) = {
            let root: rpc_message::Reader = frame.get_root()?;
            let rpc_message::Which::Call(call) = root.which()? else {
                return Err(protocol_violation("frame is not a call"));
            };
            let call = call?;
            let answer_id = call.get_question_id();
            if self.answers.contains(answer_id) {
                return Err(protocol_violation("duplicate question id"));
            }
            let results_to = match call.get_send_results_to()? {
                call::WhichSendResultsTo::Caller(()) => ResultsTo::Caller,
                call::WhichSendResultsTo::Yourself(()) => ResultsTo::Yourself,
                call::WhichSendResultsTo::ThirdParty(key) => {
                    let key: capstan::data::Reader = key.get_as()?;
                    ResultsTo::ThirdParty(key.to_vec())
                }
            };
            let (target, transform_target) = match call.get_target()?.which()? {
                message_target::Which::ImportedCap(id) => (Some(id), None),
                message_target::Which::PromisedAnswer(pa) => {
                    let pa = pa?;
                    let transform = Transform::from_reader(pa.get_transform()?)?;
                    (None, Some((pa.get_question_id(), transform)))
                }
            };
            let caps = self.decode_cap_table(&call.get_params()?)?;
            (
                answer_id,
                call.get_interface_id(),
                call.get_method_id(),
                results_to,
                target,
                transform_target,
                caps,
            )
        };

        let params = Payload::from_frame(frame.clone(), PayloadSlot::CallParams, caps.clone());
        let mut answer = Answer::new(results_to);
        answer.param_imports = caps
            .iter()
            .filter_map(|c| match c {
                CapRef::Import(id) => Some(*id),
                _ => None,
            })
            .collect();
        self.answers.insert(answer_id, answer);

        match (target, transform_target) {
            (Some(export_id), None) => {
                if !self.exports.contains(export_id) {
                    return Err(protocol_violation("call targets unknown export"));
                }
                self.dispatch_inbound_call(
                    answer_id,
                    CapRef::Export(export_id),
                    interface_id,
                    method_id,
                    params,
                    Transform::new(),
                )
            }
            (None, Some((parent_answer, transform))) => {
                self.dispatch_pipelined_call(
                    answer_id,
                    parent_answer,
                    transform,
                    interface_id,
                    method_id,
                    params,
                )
            }
            _ => Err(protocol_violation("malformed call target")),
        }
    }

    /// A call targeting the (possibly future) results of one of our answers.
    fn dispatch_pipelined_call(
        &mut self,
        answer_id: AnswerId,
        parent_answer: AnswerId,
        transform: Transform,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Result<()> {
        let parent = self
            .answers
            .get_mut(parent_answer)
            .ok_or_else(|| protocol_violation("pipelined call targets unknown answer"))?;
        if let Some(error) = parent.outcome_error.clone() {
            return self.answer_with_exception(answer_id, error);
        }
        match &parent.retained {
            Some(results) => {
                let results = results.clone();
                let cap = match results.transformed_cap(&transform) {
                    Ok(cap) => cap,
                    Err(e) => return self.answer_with_exception(answer_id, e),
                };
                self.dispatch_inbound_call(
                    answer_id, cap, interface_id, method_id, params, transform,
                )
            }
            None => {
                let ticket = parent.queued.push(QueuedCall {
                    answer_id,
                    interface_id,
                    method_id,
                    params,
                    transform,
                });
                let answer = self
                    .answers
                    .get_mut(answer_id)
                    .expect("answer was just inserted");
                answer.state = AnswerState::QueuedOnAnswer {
                    parent: parent_answer,
                    ticket,
                };
                Ok(())
            }
        }
    }

    /// Routes an inbound call to its final destination: a local server, a
    /// promise queue, or back out over the wire.
    fn dispatch_inbound_call(
        &mut self,
        answer_id: AnswerId,
        cap: CapRef,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        transform: Transform,
    ) -> Result<()> {
        match self.resolve_capref(cap) {
            CapRef::LocalServer(server) => {
                self.events.push_back(Event::IncomingCall {
                    answer_id,
                    server,
                    interface_id,
                    method_id,
                    params,
                });
                Ok(())
            }
            CapRef::Export(export_id) => {
                let export = self
                    .exports
                    .get_mut(export_id)
                    .ok_or_else(|| protocol_violation("call targets unknown export"))?;
                match &mut export.target {
                    ExportTarget::Local(server) => {
                        let server = *server;
                        self.events.push_back(Event::IncomingCall {
                            answer_id,
                            server,
                            interface_id,
                            method_id,
                            params,
                        });
                        Ok(())
                    }
                    ExportTarget::Promise { resolved: None, queued, .. } => {
                        let ticket = queued.push(QueuedCall {
                            answer_id,
                            interface_id,
                            method_id,
                            params,
                            transform,
                        });
                        let answer = self
                            .answers
                            .get_mut(answer_id)
                            .expect("answer exists while dispatching");
                        answer.state = AnswerState::QueuedOnExport {
                            parent: export_id,
                            ticket,
                        };
                        Ok(())
                    }
                    ExportTarget::Promise {
                        resolved: Some(resolution),
                        ..
                    } => {
                        let resolution = resolution.clone();
                        match resolution {
                            Ok(cap) => self.dispatch_inbound_call(
                                answer_id, cap, interface_id, method_id, params, transform,
                            ),
                            Err(e) => self.answer_with_exception(answer_id, e),
                        }
                    }
                }
            }
            CapRef::Import(import_id) => self.forward_inbound_call(
                answer_id,
                WireTarget::ImportedCap(import_id),
                interface_id,
                method_id,
                params,
            ),
            CapRef::PromisedAnswer {
                question_id,
                transform: pipeline_transform,
            } => self.forward_inbound_call(
                answer_id,
                WireTarget::PromisedAnswer {
                    question_id,
                    transform: pipeline_transform,
                },
                interface_id,
                method_id,
                params,
            ),
            CapRef::ThirdParty { vine, .. } => self.forward_inbound_call(
                answer_id,
                WireTarget::ImportedCap(vine),
                interface_id,
                method_id,
                params,
            ),
            CapRef::None | CapRef::Broken | CapRef::ThirdPartyHosted { .. } => self
                .answer_with_exception(
                    answer_id,
                    Error::from_kind(ErrorKind::CapabilityUnavailable)
                        .context("call target is not available".into()),
                ),
        }
    }

    /// Reflects a call back over the wire: the target resolved to something
    /// the peer hosts. The new question's results feed this answer's Return.
    fn forward_inbound_call(
        &mut self,
        answer_id: AnswerId,
        target: WireTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Result<()> {
        let question_id = self.questions.push(Question {
            purpose: QuestionPurpose::Forwarded { answer_id },
            state: QuestionState::Waiting,
            finish_sent: false,
            param_exports: Vec::new(),
            result_imports: Vec::new(),
        });
        let forwarded = params.to_builder()?;
        match self.send_wire_call(
            question_id,
            target,
            interface_id,
            method_id,
            forwarded,
            ResultsTo::Caller,
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.questions.erase(question_id);
                self.answer_with_exception(answer_id, e)
            }
        }
    }

    fn handle_return(&mut self, frame: &Rc<message::Reader<OwnedSegments>>) -> Result<()> {
        let (question_id, release_param_caps, outcome) = {
            let root: rpc_message::Reader = frame.get_root()?;
            let rpc_message::Which::Return(ret) = root.which()? else {
                return Err(protocol_violation("frame is not a return"));
            };
            let ret = ret?;
            let question_id = ret.get_answer_id();
            if !self.questions.contains(question_id) {
                return Err(protocol_violation("return for unknown question"));
            }
            let outcome = match ret.which()? {
                return_::Which::Results(payload) => {
                    let caps = self.decode_cap_table(&payload?)?;
                    ReturnOutcome::Results(caps)
                }
                return_::Which::Exception(exc) => {
                    ReturnOutcome::Exception(read_exception(&exc?))
                }
                return_::Which::Canceled(()) => ReturnOutcome::Canceled,
                return_::Which::ResultsSentElsewhere(()) => ReturnOutcome::Elsewhere,
                return_::Which::TakeFromOtherQuestion(other) => ReturnOutcome::TakeFrom(other),
                return_::Which::AcceptFromThirdParty(_) => ReturnOutcome::Exception(
                    Error::unimplemented("acceptFromThirdParty returns are not supported".into()),
                ),
            };
            (question_id, ret.get_release_param_caps(), outcome)
        };

        if release_param_caps {
            let param_exports = {
                let question = self
                    .questions
                    .get_mut(question_id)
                    .expect("question checked above");
                std::mem::take(&mut question.param_exports)
            };
            for export_id in param_exports {
                self.release_export_local(export_id, 1);
            }
        }

        match outcome {
            ReturnOutcome::Results(caps) => {
                {
                    let question = self
                        .questions
                        .get_mut(question_id)
                        .expect("question checked above");
                    question.result_imports = caps
                        .iter()
                        .filter_map(|c| match c {
                            CapRef::Import(id) => Some(*id),
                            _ => None,
                        })
                        .collect();
                }
                let payload =
                    Payload::from_frame(frame.clone(), PayloadSlot::ReturnResults, caps);
                self.complete_question(question_id, Ok(payload));
            }
            ReturnOutcome::Exception(error) => {
                self.complete_question(question_id, Err(error));
            }
            ReturnOutcome::Canceled => {
                self.complete_question(
                    question_id,
                    Err(Error::failed("call was canceled".into())),
                );
            }
            ReturnOutcome::Elsewhere => {
                if let Some(question) = self.questions.get_mut(question_id) {
                    question.state = QuestionState::ResultsElsewhere;
                }
            }
            ReturnOutcome::TakeFrom(other_answer) => {
                let retained = self
                    .answers
                    .get(other_answer)
                    .and_then(|a| a.retained.clone())
                    .ok_or_else(|| {
                        protocol_violation("takeFromOtherQuestion names an answer with no results")
                    })?;
                self.complete_question(question_id, Ok(retained));
            }
        }
        Ok(())
    }

    /// Delivers a question's outcome to whoever was waiting on it.
    fn complete_question(&mut self, question_id: QuestionId, result: Result<Payload>) {
        let purpose = {
            let Some(question) = self.questions.get_mut(question_id) else {
                return;
            };
            question.state = QuestionState::Returned;
            std::mem::replace(&mut question.purpose, QuestionPurpose::UserCall)
        };
        match purpose {
            QuestionPurpose::Forwarded { answer_id } => {
                let posted = match result {
                    Ok(payload) => match payload.to_builder() {
                        Ok(builder) => self.post_result(answer_id, Ok(builder)),
                        Err(e) => self.post_result(answer_id, Err(e)),
                    },
                    Err(e) => self.post_result(answer_id, Err(e)),
                };
                // The downstream answer may already be gone (canceled).
                let _ = posted;
            }
            _ => {
                self.events.push_back(Event::Returned {
                    question_id,
                    result,
                });
            }
        }
        self.maybe_release_question(question_id);
    }

    fn maybe_release_question(&mut self, question_id: QuestionId) {
        let release = match self.questions.get(question_id) {
            Some(question) => question.finish_sent && question.state != QuestionState::Waiting,
            None => false,
        };
        if release {
            self.questions.erase(question_id);
        }
    }

    fn handle_finish(&mut self, finish: &finish::Reader<'_>) -> Result<()> {
        let answer_id = finish.get_question_id();
        let release_result_caps = finish.get_release_result_caps();
        let workaround = finish.get_require_early_cancellation_workaround();

        let Some(answer) = self.answers.get_mut(answer_id) else {
            return Err(protocol_violation("finish for unknown answer"));
        };
        answer.finish_received = true;
        let provision_key = answer.provision_key.take();
        let result_exports = if release_result_caps {
            std::mem::take(&mut answer.result_exports)
        } else {
            Vec::new()
        };
        // Finishing a Provide question withdraws the provision.
        if let Some(key) = provision_key {
            self.shared_provisions.borrow_mut().provided.remove(&key);
            // A finished Provide answer carries no Return obligation the
            // introducer still waits on; reap it outright.
            self.answers.remove(answer_id);
            for export_id in result_exports {
                self.release_export_local(export_id, 1);
            }
            return Ok(());
        }
        // Finishing a pending join part abandons the whole join: the
        // remaining parts can never complete it.
        if let Some(join_id) = self.join_id_for_answer(answer_id) {
            self.discard_join(join_id, answer_id)?;
            for export_id in result_exports {
                self.release_export_local(export_id, 1);
            }
            return Ok(());
        }
        let answer = self
            .answers
            .get_mut(answer_id)
            .expect("answer checked above");

        let queued_state = match answer.state {
            AnswerState::QueuedOnAnswer { parent, ticket } => Some((QueuedParent::Answer(parent), ticket)),
            AnswerState::QueuedOnExport { parent, ticket } => Some((QueuedParent::Export(parent), ticket)),
            _ => None,
        };
        let returned = matches!(answer.state, AnswerState::Returned);

        if let Some((parent, ticket)) = queued_state {
            if workaround {
                // Legacy callers require queued promised calls to survive an
                // early Finish; the call proceeds and its Return is still
                // sent.
            } else {
                match parent {
                    QueuedParent::Answer(parent_id) => {
                        if let Some(parent) = self.answers.get_mut(parent_id) {
                            parent.queued.remove(ticket);
                        }
                    }
                    QueuedParent::Export(export_id) => {
                        if let Some(Export {
                            target: ExportTarget::Promise { queued, .. },
                            ..
                        }) = self.exports.get_mut(export_id)
                        {
                            queued.remove(ticket);
                        }
                    }
                }
                // The id stays reserved until the caller sees a Return.
                self.send_return_canceled(answer_id)?;
                self.answers.remove(answer_id);
            }
        } else if returned {
            self.answers.remove(answer_id);
        }
        // Dispatched answers stay: the Return must still be sent before the
        // id is recycled.

        for export_id in result_exports {
            self.release_export_local(export_id, 1);
        }
        Ok(())
    }

    /// The join, if any, that `answer_id` is a registered part of.
    fn join_id_for_answer(&self, answer_id: AnswerId) -> Option<u32> {
        self.joins.iter().find_map(|(join_id, state)| {
            state
                .parts
                .values()
                .any(|(part_answer, _)| *part_answer == answer_id)
                .then_some(*join_id)
        })
    }

    /// Discards a join that one of its callers walked away from. The
    /// finished part still gets its canceled Return before its id recycles;
    /// every other registered part fails.
    fn discard_join(&mut self, join_id: u32, finished_answer: AnswerId) -> Result<()> {
        let Some(state) = self.joins.remove(&join_id) else {
            return Ok(());
        };
        let mut parts: Vec<(u16, (AnswerId, CapRef))> = state.parts.into_iter().collect();
        parts.sort_by_key(|(part_num, _)| *part_num);
        for (_, (part_answer, _)) in parts {
            if part_answer == finished_answer {
                self.send_return_canceled(part_answer)?;
                self.answers.remove(part_answer);
            } else {
                self.answer_with_exception(
                    part_answer,
                    Error::failed("join was abandoned before all parts arrived".into()),
                )?;
            }
        }
        Ok(())
    }

    fn send_return_canceled(&mut self, answer_id: AnswerId) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            ret.set_canceled();
        }
        self.send_message(builder, OutboundCapEffects::new())
    }

    fn handle_resolve(&mut self, resolve: &resolve::Reader<'_>) -> Result<()> {
        let import_id = resolve.get_promise_id();
        let resolution = match resolve.which()? {
            resolve::Which::Cap(descriptor) => Ok(self.decode_cap(&descriptor?)?),
            resolve::Which::Exception(exc) => Err(read_exception(&exc?)),
        };

        let Some(import) = self.imports.get_mut(import_id) else {
            // We released this import before the Resolve arrived. Drop the
            // reference the resolution just handed us.
            if let Ok(CapRef::Import(id)) = resolution {
                self.release_import_local(id, 1);
            }
            return Ok(());
        };

        let needs_embargo = match &import.state {
            ImportState::Promise { calls_sent } => *calls_sent && resolution.is_ok(),
            ImportState::Settled | ImportState::Resolved { .. } => {
                return Err(protocol_violation("resolve of a settled capability"))
            }
        };

        if needs_embargo {
            let embargo_id = self.embargoes.push(Embargo {
                import_id,
                queued: Vec::new(),
            });
            let import = self
                .imports
                .get_mut(import_id)
                .expect("import checked above");
            import.state = ImportState::Resolved {
                cap: resolution,
                embargo: Some(embargo_id),
            };
            self.send_disembargo(
                &CapRef::Import(import_id),
                disembargo::WhichContext::SenderLoopback(embargo_id),
            )?;
        } else {
            import.state = ImportState::Resolved {
                cap: resolution,
                embargo: None,
            };
        }
        self.events.push_back(Event::Resolved { import_id });
        Ok(())
    }

    fn handle_release(&mut self, release: &release::Reader<'_>) -> Result<()> {
        let export_id = release.get_id();
        let count = release.get_reference_count();
        if !self.exports.contains(export_id) {
            return Err(protocol_violation("release of unknown export"));
        }
        self.release_export_local(export_id, count);
        Ok(())
    }

    fn handle_disembargo(&mut self, disembargo: &disembargo::Reader<'_>) -> Result<()> {
        match disembargo.get_context()? {
            disembargo::WhichContext::SenderLoopback(embargo_id) => {
                // Validate the target refers to something live before
                // echoing, rejecting violations early.
                let target = disembargo.get_target()?;
                let raw_target = match target.which()? {
                    message_target::Which::ImportedCap(export_id) => {
                        if !self.exports.contains(export_id) {
                            return Err(protocol_violation(
                                "disembargo targets unknown export",
                            ));
                        }
                        RawTarget::ImportedCap(export_id)
                    }
                    message_target::Which::PromisedAnswer(pa) => {
                        let pa = pa?;
                        if !self.answers.contains(pa.get_question_id()) {
                            return Err(protocol_violation(
                                "disembargo targets unknown answer",
                            ));
                        }
                        RawTarget::PromisedAnswer {
                            question_id: pa.get_question_id(),
                            transform: Transform::from_reader(pa.get_transform()?)?,
                        }
                    }
                };
                self.send_disembargo_echo(raw_target, embargo_id)
            }
            disembargo::WhichContext::ReceiverLoopback(embargo_id) => {
                let Some(embargo) = self.embargoes.erase(embargo_id) else {
                    return Err(protocol_violation("disembargo echo for unknown embargo"));
                };
                if let Some(import) = self.imports.get_mut(embargo.import_id) {
                    if let ImportState::Resolved { embargo: e, .. } = &mut import.state {
                        *e = None;
                    }
                }
                let resolved = match self.imports.get(embargo.import_id) {
                    Some(Import {
                        state: ImportState::Resolved { cap, .. },
                        ..
                    }) => cap.clone(),
                    _ => Ok(CapRef::Import(embargo.import_id)),
                };
                for held in embargo.queued {
                    match &resolved {
                        Ok(cap) => {
                            let outcome = self.dispatch_outbound_call(
                                held.question_id,
                                cap.clone(),
                                held.interface_id,
                                held.method_id,
                                held.params,
                                held.results_to,
                            );
                            if let Err(e) = outcome {
                                self.complete_question(held.question_id, Err(e));
                            }
                        }
                        Err(e) => {
                            self.complete_question(held.question_id, Err(e.clone()));
                        }
                    }
                }
                Ok(())
            }
            disembargo::WhichContext::Accept(()) => {
                // Accept embargoes lift as soon as the provision completed;
                // nothing is held on this path.
                Ok(())
            }
            disembargo::WhichContext::Provide(_) => Ok(()),
        }
    }

    /// Echo half of the loopback dance. The target is copied verbatim from
    /// the request; the receiver matches on the embargo id.
    fn send_disembargo_echo(&mut self, target: RawTarget, embargo_id: EmbargoId) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut disembargo = root.init_disembargo();
            let mut target_builder = disembargo.init_target();
            match target {
                RawTarget::ImportedCap(id) => target_builder.set_imported_cap(id),
                RawTarget::PromisedAnswer {
                    question_id,
                    transform,
                } => {
                    let mut promised = target_builder.init_promised_answer();
                    promised.set_question_id(question_id);
                    transform.write_to(promised);
                }
            }
            disembargo.set_context_receiver_loopback(embargo_id);
        }
        self.send_message(builder, OutboundCapEffects::new())
    }

    fn handle_provide(&mut self, provide: &provide::Reader<'_>) -> Result<()> {
        let answer_id = provide.get_question_id();
        if self.answers.contains(answer_id) {
            return Err(protocol_violation("duplicate question id"));
        }
        let target = self.read_message_target(&provide.get_target()?)?;
        let key: capstan::data::Reader = provide.get_recipient().get_as()?;
        let key = key.to_vec();

        let mut answer = Answer::new(ResultsTo::Caller);
        answer.provision_key = Some(key.clone());
        self.answers.insert(answer_id, answer);

        // The provided capability must actually be hosted here; the whole
        // point of the handoff is to cut the introducer out of the path.
        let server = match self.resolve_capref(target) {
            CapRef::LocalServer(server) => server,
            CapRef::Export(export_id) => match self.exports.get(export_id) {
                Some(Export {
                    target: ExportTarget::Local(server),
                    ..
                }) => *server,
                _ => {
                    return self.answer_with_exception(
                        answer_id,
                        Error::from_kind(ErrorKind::CapabilityUnavailable)
                            .context("provided capability is not hosted by this vat".into()),
                    )
                }
            },
            _ => {
                return self.answer_with_exception(
                    answer_id,
                    Error::from_kind(ErrorKind::CapabilityUnavailable)
                        .context("provided capability is not hosted by this vat".into()),
                )
            }
        };

        {
            let mut shared = self.shared_provisions.borrow_mut();
            if shared.provided.contains_key(&key) {
                return Err(protocol_violation("duplicate provision key"));
            }
            shared.provided.insert(key.clone(), server);
        }

        // Accepts that raced ahead on this same connection complete now;
        // other connections redeem via `redeem_pending_accepts`.
        if let Some(answers) = self.pending_accepts.remove(&key) {
            for accept_answer in answers {
                self.complete_accept(accept_answer, CapRef::LocalServer(server))?;
            }
        }
        // Acknowledge the registration so the introducer can retire its
        // question once the recipient has accepted.
        self.answer_with_results(answer_id, PayloadBuilder::new())
    }

    fn handle_accept(&mut self, accept: &accept::Reader<'_>) -> Result<()> {
        let answer_id = accept.get_question_id();
        if self.answers.contains(answer_id) {
            return Err(protocol_violation("duplicate question id"));
        }
        // Strict flag decode: rejects overloaded flag bytes.
        let _embargo = accept.get_embargo()?;
        let key: capstan::data::Reader = accept.get_provision().get_as()?;
        let key = key.to_vec();

        self.answers.insert(answer_id, Answer::new(ResultsTo::Caller));

        let provided = self.shared_provisions.borrow().provided.get(&key).copied();
        if let Some(server) = provided {
            return self.complete_accept(answer_id, CapRef::LocalServer(server));
        }
        if let Some(held) = self.results_provisions.remove(&key) {
            return self.deliver_retained_results(answer_id, held);
        }
        self.pending_accepts.entry(key).or_default().push(answer_id);
        Ok(())
    }

    /// Answers an Accept with the provided capability.
    fn complete_accept(&mut self, answer_id: AnswerId, target: CapRef) -> Result<()> {
        let mut payload = PayloadBuilder::new();
        payload.set_cap(target);
        self.answer_with_results(answer_id, payload)
    }

    /// Answers an Accept with the retained results of a
    /// `sendResultsTo.thirdParty` call.
    fn deliver_retained_results(
        &mut self,
        accept_answer: AnswerId,
        results_answer: AnswerId,
    ) -> Result<()> {
        let retained = self
            .answers
            .get(results_answer)
            .and_then(|a| a.retained.clone())
            .ok_or_else(|| protocol_violation("no retained results for this provision"))?;
        let builder = retained.to_builder()?;
        self.answer_with_results(accept_answer, builder)
    }

    fn handle_join(&mut self, join: &join::Reader<'_>) -> Result<()> {
        let answer_id = join.get_question_id();
        if self.answers.contains(answer_id) {
            return Err(protocol_violation("duplicate question id"));
        }
        let target = self.read_message_target(&join.get_target()?)?;
        let key = join.get_key_part()?;
        let join_id = key.get_join_id();
        let part_count = key.get_part_count();
        let part_num = key.get_part_num();
        if part_count == 0 || part_num >= part_count {
            return Err(protocol_violation("malformed join key part"));
        }

        self.answers.insert(answer_id, Answer::new(ResultsTo::Caller));
        let resolved = self.resolve_capref(target);

        let state = self.joins.entry(join_id).or_insert_with(|| JoinState {
            part_count,
            parts: HashMap::new(),
        });
        if state.part_count != part_count || state.parts.contains_key(&part_num) {
            return Err(protocol_violation("inconsistent join key part"));
        }
        state.parts.insert(part_num, (answer_id, resolved));

        if state.parts.len() == state.part_count as usize {
            let state = self.joins.remove(&join_id).expect("join state exists");
            let mut parts: Vec<(u16, (AnswerId, CapRef))> = state.parts.into_iter().collect();
            parts.sort_by_key(|(part_num, _)| *part_num);
            let first = parts[0].1 .1.clone();
            let all_match = parts.iter().all(|(_, (_, cap))| *cap == first);
            for (_, (part_answer, _)) in parts.drain(..) {
                if all_match {
                    let mut payload = PayloadBuilder::new();
                    payload.set_cap(first.clone());
                    self.answer_with_results(part_answer, payload)?;
                } else {
                    self.answer_with_exception(
                        part_answer,
                        Error::failed("join parts do not designate the same capability".into()),
                    )?;
                }
            }
        }
        Ok(())
    }

    // -- answering --------------------------------------------------------

    fn answer_with_results(
        &mut self,
        answer_id: AnswerId,
        payload: PayloadBuilder,
    ) -> Result<()> {
        let results_to = match self.answers.get(answer_id) {
            Some(answer) => answer.results_to.clone(),
            None => return Err(protocol_violation("answer disappeared")),
        };
        match results_to {
            ResultsTo::Caller => {
                let mut builder = message::Builder::new_default();
                let mut effects = OutboundCapEffects::new();
                let mut export_ids = Vec::new();
                {
                    let root = builder.init_root::<rpc_message::Builder>();
                    let mut ret = root.init_return();
                    ret.set_answer_id(answer_id);
                    let mut results = ret.init_results();
                    results.get_content().set_as(
                        payload
                            .message
                            .get_root_as_reader::<capstan::any_pointer::Reader>()?,
                    )?;
                    self.encode_cap_table(
                        &payload.caps,
                        &mut results,
                        &mut effects,
                        &mut export_ids,
                    )?;
                }
                self.send_message(builder, effects)?;
                if let Some(answer) = self.answers.get_mut(answer_id) {
                    answer.result_exports = export_ids;
                }
                self.complete_answer_locally(answer_id, Payload::from_builder(payload));
                Ok(())
            }
            ResultsTo::Yourself | ResultsTo::ThirdParty(_) => {
                let mut builder = message::Builder::new_default();
                {
                    let root = builder.init_root::<rpc_message::Builder>();
                    let mut ret = root.init_return();
                    ret.set_answer_id(answer_id);
                    ret.set_results_sent_elsewhere();
                }
                self.send_message(builder, OutboundCapEffects::new())?;
                self.complete_answer_locally(answer_id, Payload::from_builder(payload));
                if let ResultsTo::ThirdParty(key) = results_to {
                    // Results are now redeemable by an Accept bearing the
                    // key. An Accept that raced ahead completes here.
                    match self.pending_accepts.remove(&key) {
                        Some(accepts) => {
                            for accept_answer in accepts {
                                self.deliver_retained_results(accept_answer, answer_id)?;
                            }
                        }
                        None => {
                            self.results_provisions.insert(key, answer_id);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn answer_with_exception(&mut self, answer_id: AnswerId, error: Error) -> Result<()> {
        if !self.answers.contains(answer_id) {
            return Err(protocol_violation("answer disappeared"));
        }
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            let mut exc = ret.init_exception();
            write_exception(&mut exc, &error)?;
        }
        self.send_message(builder, OutboundCapEffects::new())?;
        if let Some(answer) = self.answers.get_mut(answer_id) {
            answer.outcome_error = Some(error.clone());
        }
        self.fail_queued_on_answer(answer_id, &error);
        self.seal_answer(answer_id, None);
        Ok(())
    }

    /// Marks the answer returned, retains its results for pipelining and
    /// take-from, replays queued pipelined calls, and reaps it if Finish
    /// already arrived.
    fn complete_answer_locally(&mut self, answer_id: AnswerId, results: Payload) {
        let queued = {
            let Some(answer) = self.answers.get_mut(answer_id) else {
                return;
            };
            answer.retained = Some(results.clone());
            answer.queued.drain().collect::<Vec<_>>()
        };
        for call in queued {
            let resolution = results.transformed_cap(&call.transform);
            self.redispatch_queued(call, resolution);
        }
        self.seal_answer(answer_id, Some(results));
    }

    fn redispatch_queued(&mut self, call: QueuedCall, resolution: Result<CapRef>) {
        // The queued call's own answer may have been canceled meanwhile.
        if !self.answers.contains(call.answer_id) {
            return;
        }
        if let Some(answer) = self.answers.get_mut(call.answer_id) {
            answer.state = AnswerState::Dispatched;
        }
        let outcome = match resolution {
            Ok(cap) => self.dispatch_inbound_call(
                call.answer_id,
                cap,
                call.interface_id,
                call.method_id,
                call.params,
                call.transform,
            ),
            Err(e) => self.answer_with_exception(call.answer_id, e),
        };
        if let Err(e) = outcome {
            let _ = self.answer_with_exception(call.answer_id, e);
        }
    }

    fn fail_queued_on_answer(&mut self, answer_id: AnswerId, error: &Error) {
        let queued = match self.answers.get_mut(answer_id) {
            Some(answer) => answer.queued.drain().collect::<Vec<_>>(),
            None => return,
        };
        for call in queued {
            if self.answers.contains(call.answer_id) {
                if let Some(answer) = self.answers.get_mut(call.answer_id) {
                    answer.state = AnswerState::Dispatched;
                }
                let _ = self.answer_with_exception(call.answer_id, error.clone());
            }
        }
    }

    fn seal_answer(&mut self, answer_id: AnswerId, retained: Option<Payload>) {
        let (finish_received, param_imports) = {
            let Some(answer) = self.answers.get_mut(answer_id) else {
                return;
            };
            answer.state = AnswerState::Returned;
            if retained.is_some() {
                answer.retained = retained;
            }
            (
                answer.finish_received,
                std::mem::take(&mut answer.param_imports),
            )
        };
        // Our Returns carry `releaseParamCaps`, so the references that came
        // in with the call's params drop here without Release messages.
        for import_id in param_imports {
            self.release_import_local(import_id, 1);
        }
        if finish_received {
            self.answers.remove(answer_id);
        }
    }

    // -- capability plumbing ----------------------------------------------

    /// Follows resolution chains to the most settled form of a capability.
    fn resolve_capref(&self, mut cap: CapRef) -> CapRef {
        for _ in 0..64 {
            match cap {
                CapRef::Import(import_id) => match self.imports.get(import_id) {
                    Some(Import {
                        state:
                            ImportState::Resolved {
                                cap: Ok(inner),
                                embargo: None,
                            },
                        ..
                    }) => {
                        cap = inner.clone();
                    }
                    _ => return CapRef::Import(import_id),
                },
                other => return other,
            }
        }
        cap
    }

    fn pending_embargo_for(&self, import_id: ImportId) -> Option<EmbargoId> {
        match self.imports.get(import_id) {
            Some(Import {
                state:
                    ImportState::Resolved {
                        embargo: Some(id), ..
                    },
                ..
            }) => Some(*id),
            _ => None,
        }
    }

    fn write_message_target(
        &self,
        target: &CapRef,
        builder: &mut message_target::Builder<'_>,
    ) -> Result<()> {
        match self.resolve_capref(target.clone()) {
            CapRef::Import(id) => {
                builder.set_imported_cap(id);
                Ok(())
            }
            CapRef::PromisedAnswer {
                question_id,
                transform,
            } => {
                let mut promised = builder.init_promised_answer();
                promised.set_question_id(question_id);
                transform.write_to(promised);
                Ok(())
            }
            CapRef::ThirdParty { vine, .. } => {
                builder.set_imported_cap(vine);
                Ok(())
            }
            _ => Err(Error::from_kind(ErrorKind::CapabilityUnavailable)
                .context("message target must be hosted by the peer".into())),
        }
    }

    fn read_message_target(&self, target: &message_target::Reader<'_>) -> Result<CapRef> {
        match target.which()? {
            message_target::Which::ImportedCap(export_id) => {
                if !self.exports.contains(export_id) {
                    return Err(protocol_violation("target names unknown export"));
                }
                Ok(CapRef::Export(export_id))
            }
            message_target::Which::PromisedAnswer(pa) => {
                let pa = pa?;
                let answer_id = pa.get_question_id();
                let transform = Transform::from_reader(pa.get_transform()?)?;
                let Some(answer) = self.answers.get(answer_id) else {
                    return Err(protocol_violation("target names unknown answer"));
                };
                match &answer.retained {
                    Some(results) => results.transformed_cap(&transform),
                    None => Err(Error::from_kind(ErrorKind::CapabilityUnavailable)
                        .context("target answer has not resolved yet".into())),
                }
            }
        }
    }

    /// Encodes an outbound cap table, staging the table side-effects.
    fn encode_cap_table(
        &mut self,
        caps: &[CapRef],
        payload: &mut payload::Builder<'_>,
        effects: &mut OutboundCapEffects,
        export_ids: &mut Vec<ExportId>,
    ) -> Result<()> {
        let mut table = payload.init_cap_table(caps.len() as u32);
        for (i, cap) in caps.iter().enumerate() {
            let mut descriptor = table.reborrow().get(i as u32);
            self.encode_cap(cap, &mut descriptor, effects, export_ids)?;
        }
        Ok(())
    }

    fn encode_cap(
        &mut self,
        cap: &CapRef,
        descriptor: &mut cap_descriptor::Builder<'_>,
        effects: &mut OutboundCapEffects,
        export_ids: &mut Vec<ExportId>,
    ) -> Result<()> {
        match cap {
            CapRef::None | CapRef::Broken => {
                descriptor.set_none();
                Ok(())
            }
            CapRef::LocalServer(server) => {
                let export_id = self.stage_local_export(*server, effects);
                export_ids.push(export_id);
                descriptor.set_sender_hosted(export_id);
                Ok(())
            }
            CapRef::Export(export_id) => {
                let export = self
                    .exports
                    .get(*export_id)
                    .ok_or_else(|| protocol_violation("payload references unknown export"))?;
                effects.push(StagedEffect::ExportRef(*export_id));
                export_ids.push(*export_id);
                match &export.target {
                    ExportTarget::Promise { resolved: None, .. } => {
                        effects.push(StagedEffect::PromiseRegistration(*export_id));
                        descriptor.set_sender_promise(*export_id);
                    }
                    _ => descriptor.set_sender_hosted(*export_id),
                }
                Ok(())
            }
            CapRef::Import(import_id) => {
                descriptor.set_receiver_hosted(*import_id);
                Ok(())
            }
            CapRef::PromisedAnswer {
                question_id,
                transform,
            } => {
                let mut promised = descriptor.init_receiver_answer();
                promised.set_question_id(*question_id);
                transform.write_to(promised);
                Ok(())
            }
            CapRef::ThirdPartyHosted {
                third_party_id,
                vine,
            } => {
                let vine_export = self.stage_local_export(*vine, effects);
                export_ids.push(vine_export);
                let mut third_party = descriptor.init_third_party_hosted();
                third_party.set_vine_id(vine_export);
                third_party.init_id().set_as(&third_party_id[..])?;
                Ok(())
            }
            CapRef::ThirdParty { .. } => Err(Error::unimplemented(
                "forwarding a third-party capability without accepting it is not supported"
                    .into(),
            )),
        }
    }

    /// Finds or creates the export entry for a local server slot. The entry
    /// is created immediately (so its id can be encoded) but carries no
    /// references until commit.
    fn stage_local_export(
        &mut self,
        server: ServerId,
        effects: &mut OutboundCapEffects,
    ) -> ExportId {
        let existing = self.exports_by_server.get(&server).copied();
        match existing {
            Some(export_id) if self.exports.contains(export_id) => {
                effects.push(StagedEffect::ExportRef(export_id));
                export_id
            }
            _ => {
                let export_id = self.exports.push(Export {
                    ref_count: 0,
                    target: ExportTarget::Local(server),
                });
                self.exports_by_server.insert(server, export_id);
                effects.push(StagedEffect::NewExport(export_id));
                export_id
            }
        }
    }

    /// Decodes an inbound cap table, applying import-side effects
    /// immediately. If a later stage of handling fails before dispatch, the
    /// handler unwinds these with [Peer::release_import_local].
    fn decode_cap_table(&mut self, payload: &payload::Reader<'_>) -> Result<Vec<CapRef>> {
        if !payload.has_cap_table() {
            return Ok(Vec::new());
        }
        let table = payload.get_cap_table()?;
        let mut caps = Vec::with_capacity(table.len() as usize);
        let mut applied: Vec<ImportId> = Vec::new();
        for i in 0..table.len() {
            match self.decode_cap(&table.get(i)) {
                Ok(cap) => {
                    if let CapRef::Import(id) | CapRef::ThirdParty { vine: id, .. } = &cap {
                        applied.push(*id);
                    }
                    caps.push(cap);
                }
                Err(e) => {
                    for id in applied.drain(..) {
                        self.release_import_local(id, 1);
                    }
                    return Err(e);
                }
            }
        }
        Ok(caps)
    }

    fn decode_cap(&mut self, descriptor: &cap_descriptor::Reader<'_>) -> Result<CapRef> {
        match descriptor.which()? {
            cap_descriptor::Which::None(()) => Ok(CapRef::None),
            cap_descriptor::Which::SenderHosted(id) => {
                self.add_import_ref(id, false);
                Ok(CapRef::Import(id))
            }
            cap_descriptor::Which::SenderPromise(id) => {
                self.add_import_ref(id, true);
                Ok(CapRef::Import(id))
            }
            cap_descriptor::Which::ReceiverHosted(id) => {
                if !self.exports.contains(id) {
                    return Err(protocol_violation("descriptor references unknown export"));
                }
                Ok(CapRef::Export(id))
            }
            cap_descriptor::Which::ReceiverAnswer(pa) => {
                let pa = pa?;
                let answer_id = pa.get_question_id();
                let transform = Transform::from_reader(pa.get_transform()?)?;
                let Some(answer) = self.answers.get(answer_id) else {
                    return Err(protocol_violation("descriptor references unknown answer"));
                };
                match &answer.retained {
                    Some(results) => results.transformed_cap(&transform),
                    // The answer is still running; the capability cannot be
                    // named yet.
                    None => Ok(CapRef::Broken),
                }
            }
            cap_descriptor::Which::ThirdPartyHosted(third) => {
                let third = third?;
                let vine_id = third.get_vine_id();
                self.add_import_ref(vine_id, false);
                let id: capstan::data::Reader = third.get_id().get_as()?;
                Ok(CapRef::ThirdParty {
                    third_party_id: id.to_vec(),
                    vine: vine_id,
                })
            }
        }
    }

    fn add_import_ref(&mut self, id: ImportId, promise: bool) {
        let import = self.imports.entry(id).or_insert_with(|| Import {
            ref_count: 0,
            state: if promise {
                ImportState::Promise { calls_sent: false }
            } else {
                ImportState::Settled
            },
        });
        import.ref_count += 1;
    }

    fn release_import_local(&mut self, id: ImportId, count: u32) {
        if let Some(import) = self.imports.get_mut(id) {
            import.ref_count = import.ref_count.saturating_sub(count);
            if import.ref_count == 0 {
                self.imports.remove(id);
            }
        }
    }

    fn release_export_local(&mut self, id: ExportId, count: u32) {
        let remove = match self.exports.get_mut(id) {
            Some(export) => {
                export.ref_count = export.ref_count.saturating_sub(count);
                export.ref_count == 0
            }
            None => false,
        };
        if remove {
            if let Some(export) = self.exports.erase(id) {
                if let ExportTarget::Local(server) = export.target {
                    if self.exports_by_server.get(&server) == Some(&id) {
                        self.exports_by_server.remove(&server);
                    }
                }
            }
        }
    }

    // -- framing and teardown ---------------------------------------------

    /// Serializes and sends a frame. Staged capability effects commit only
    /// if the transport accepts the frame; otherwise they unwind and the
    /// error surfaces to the caller.
    fn send_message(
        &mut self,
        builder: message::Builder,
        effects: OutboundCapEffects,
    ) -> Result<()> {
        let bytes = serialize::write_message_to_bytes(&builder);
        match self.transport.send_frame(bytes) {
            Ok(()) => {
                effects.commit(self);
                Ok(())
            }
            Err(e) => {
                effects.rollback(self);
                Err(e)
            }
        }
    }

    fn send_abort(&mut self, error: &Error) {
        let mut builder = message::Builder::new_default();
        {
            let root = builder.init_root::<rpc_message::Builder>();
            let mut exc = root.init_abort();
            if write_exception(&mut exc, error).is_err() {
                return;
            }
        }
        let _ = self.send_message(builder, OutboundCapEffects::new());
    }

    /// Tears the connection down: every outstanding question fails, all
    /// tables empty, and the error callback fires exactly once.
    fn abort_with(&mut self, error: Error) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(error.clone());

        for (question_id, _) in self.questions.drain() {
            self.events.push_back(Event::Returned {
                question_id,
                result: Err(error.clone()),
            });
        }
        self.answers.drain();
        self.exports.drain();
        self.exports_by_server.clear();
        self.imports.drain();
        self.embargoes.drain();
        self.pending_accepts.clear();
        self.results_provisions.clear();
        self.joins.clear();

        // Capture the callback before invoking it: it may drop us.
        let on_error = self.on_error.take();
        self.events.push_back(Event::Aborted {
            error: error.clone(),
        });
        if let Some(callback) = on_error {
            callback(&error);
        }
    }

    /// Closes the connection locally. Outstanding questions drain with
    /// `ConnectionClosed`. Idempotent.
    pub fn shutdown(&mut self, _drain: bool) {
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.abort_with(Error::from_kind(ErrorKind::ConnectionClosed));
    }
}

impl EffectTables for Peer {
    fn grant_export_ref(&mut self, id: ExportId) {
        if let Some(export) = self.exports.get_mut(id) {
            export.ref_count += 1;
        }
    }

    fn discard_fresh_export(&mut self, id: ExportId) {
        if let Some(export) = self.exports.erase(id) {
            if let ExportTarget::Local(server) = export.target {
                if self.exports_by_server.get(&server) == Some(&id) {
                    self.exports_by_server.remove(&server);
                }
            }
        }
    }

    fn register_promise_advertisement(&mut self, id: ExportId) {
        if let Some(Export {
            target: ExportTarget::Promise { advertised, .. },
            ..
        }) = self.exports.get_mut(id)
        {
            *advertised = true;
        }
    }
}

enum WireTarget {
    ImportedCap(ImportId),
    PromisedAnswer {
        question_id: QuestionId,
        transform: Transform,
    },
}

/// A message target copied verbatim, without reinterpreting ids against our
/// own tables.
enum RawTarget {
    ImportedCap(u32),
    PromisedAnswer {
        question_id: u32,
        transform: Transform,
    },
}

enum QueuedParent {
    Answer(AnswerId),
    Export(ExportId),
}

enum ReturnOutcome {
    Results(Vec<CapRef>),
    Exception(Error),
    Canceled,
    Elsewhere,
    TakeFrom(AnswerId),
}

fn protocol_violation(context: &str) -> Error {
    Error::from_kind(ErrorKind::ProtocolViolation).context(context.to_string())
}

/// Wire-level decode failures escalate to an Abort; transport and
/// application errors do not.
fn is_fatal_inbound_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ProtocolViolation
            | ErrorKind::InvalidPointer
            | ErrorKind::InvalidSegmentId
            | ErrorKind::TruncatedMessage
            | ErrorKind::InvalidEnumValue
            | ErrorKind::NestingLimitExceeded
            | ErrorKind::TraversalLimitExceeded
            | ErrorKind::ElementCountTooLarge
            | ErrorKind::ArithmeticOverflow
            | ErrorKind::SegmentCountLimitExceeded
            | ErrorKind::FrameTooLarge
    )
}

fn write_exception(builder: &mut exception::Builder<'_>, error: &Error) -> Result<()> {
    builder.set_type(match error.kind {
        ErrorKind::Overloaded => exception::Type::Overloaded,
        ErrorKind::Disconnected | ErrorKind::ConnectionClosed | ErrorKind::ConnectionAborted => {
            exception::Type::Disconnected
        }
        ErrorKind::Unimplemented => exception::Type::Unimplemented,
        _ => exception::Type::Failed,
    });
    builder.set_reason(&error.to_string())
}

fn read_exception(reader: &exception::Reader<'_>) -> Error {
    let kind = match reader.get_type() {
        Ok(exception::Type::Overloaded) => ErrorKind::Overloaded,
        Ok(exception::Type::Disconnected) => ErrorKind::Disconnected,
        Ok(exception::Type::Unimplemented) => ErrorKind::Unimplemented,
        _ => ErrorKind::Failed,
    };
    let reason = reader
        .get_reason()
        .ok()
        .and_then(|r| r.to_str().ok().map(|s| s.to_string()))
        .unwrap_or_default();
    Error::from_kind(kind).context(reason)
}
