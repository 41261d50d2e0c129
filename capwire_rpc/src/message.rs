//! Codec between wire frames and the structured `Message` union.
//!
//! Parsing turns a framed message into an [`RpcMessage`]; the builders emit
//! complete frames ready for the transport. Cap tables travel as positional
//! descriptor lists; translating them to and from capability handles is the
//! vat's job.

use crate::{rpc_schema as schema, AnswerId, QuestionId, RpcError, RpcResult};
use capwire::{emit_message, AmSegments, ElemView, Object, Ref, SegmentStore};

/// One entry of a payload's wire cap table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireCapDescriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer {
        question_id: QuestionId,
        transform: Vec<u16>,
    },
    ThirdPartyHosted,
}

/// The target of a `call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireTarget {
    ImportedCap(u32),
    PromisedAnswer {
        question_id: QuestionId,
        transform: Vec<u16>,
    },
}

/// Content root plus the positional descriptor table.
#[derive(Debug, Clone)]
pub(crate) struct WirePayload {
    pub root: Ref,
    pub cap_table: Vec<WireCapDescriptor>,
}

#[derive(Debug, Clone)]
pub(crate) enum WireReturn {
    Results(WirePayload),
    Exception(String),
    Canceled,
}

/// A parsed inbound message.
#[derive(Debug)]
pub(crate) enum RpcMessage {
    Unimplemented {
        /// Root of the message the peer echoed back.
        echoed: Ref,
    },
    Abort {
        reason: String,
    },
    Call {
        question_id: QuestionId,
        interface_id: u64,
        method_id: u16,
        target: WireTarget,
        params: WirePayload,
    },
    Return {
        answer_id: AnswerId,
        release_param_caps: bool,
        body: WireReturn,
    },
    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },
    Release {
        id: u32,
        reference_count: u32,
    },
    Restore {
        question_id: QuestionId,
        object_id: String,
    },
    /// A variant outside our level; `root` is the whole received message,
    /// kept for the `unimplemented` echo.
    Other {
        tag: u16,
        root: Ref,
    },
}

// ---------------------------------------------------------------
// parse
// ---------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn parse_message(segments: Vec<Vec<u8>>) -> RpcResult<RpcMessage> {
    let data = SegmentStore::from_segments(segments)?.into_shared();
    let msg = Object::read_root(&data, schema::MESSAGE)?;
    let tag = msg.get_data(&schema::message::TAG);
    let body = msg.get_ptr(&schema::message::BODY)?;
    trace!("parse_message: tag {tag}");

    Ok(match tag {
        schema::message::UNIMPLEMENTED => RpcMessage::Unimplemented { echoed: body },
        schema::message::ABORT => {
            let exc = Object::with_ref(body, schema::exception::SIZE);
            RpcMessage::Abort {
                reason: exc.get_text(&schema::exception::REASON)?,
            }
        }
        schema::message::CALL => {
            let call = Object::with_ref(body, schema::call::SIZE);
            RpcMessage::Call {
                question_id: call.get_data(&schema::call::QUESTION_ID) as u32,
                interface_id: call.get_data(&schema::call::INTERFACE_ID),
                method_id: call.get_data(&schema::call::METHOD_ID) as u16,
                target: parse_target(call.get_ptr(&schema::call::TARGET)?)?,
                params: parse_payload(call.get_ptr(&schema::call::PARAMS)?)?,
            }
        }
        schema::message::RETURN => {
            let ret = Object::with_ref(body, schema::ret::SIZE);
            let body = match ret.get_data(&schema::ret::TAG) {
                schema::ret::TAG_RESULTS => {
                    WireReturn::Results(parse_payload(ret.get_ptr(&schema::ret::BODY)?)?)
                }
                schema::ret::TAG_EXCEPTION => {
                    let exc = Object::with_ref(
                        ret.get_ptr(&schema::ret::BODY)?,
                        schema::exception::SIZE,
                    );
                    WireReturn::Exception(exc.get_text(&schema::exception::REASON)?)
                }
                schema::ret::TAG_CANCELED => WireReturn::Canceled,
                other => {
                    return Err(RpcError::Unimplemented(format!("return union tag {other}")));
                }
            };
            RpcMessage::Return {
                answer_id: ret.get_data(&schema::ret::ANSWER_ID) as u32,
                release_param_caps: ret.get_bool(&schema::ret::RELEASE_PARAM_CAPS),
                body,
            }
        }
        schema::message::FINISH => {
            let finish = Object::with_ref(body, schema::finish::SIZE);
            RpcMessage::Finish {
                question_id: finish.get_data(&schema::finish::QUESTION_ID) as u32,
                release_result_caps: finish.get_bool(&schema::finish::RELEASE_RESULT_CAPS),
            }
        }
        schema::message::RELEASE => {
            let release = Object::with_ref(body, schema::release::SIZE);
            RpcMessage::Release {
                id: release.get_data(&schema::release::ID) as u32,
                reference_count: release.get_data(&schema::release::REFERENCE_COUNT) as u32,
            }
        }
        schema::message::RESTORE => {
            let restore = Object::with_ref(body, schema::restore::SIZE);
            RpcMessage::Restore {
                question_id: restore.get_data(&schema::restore::QUESTION_ID) as u32,
                object_id: restore.get_text(&schema::restore::OBJECT_ID)?,
            }
        }
        other => RpcMessage::Other {
            tag: other as u16,
            root: msg.reference().clone(),
        },
    })
}

#[allow(clippy::cast_possible_truncation)]
fn parse_target(target_ref: Ref) -> RpcResult<WireTarget> {
    let target = Object::with_ref(target_ref, schema::target::SIZE);
    match target.get_data(&schema::target::TAG) {
        schema::target::TAG_IMPORTED_CAP => Ok(WireTarget::ImportedCap(
            target.get_data(&schema::target::IMPORTED_CAP) as u32,
        )),
        schema::target::TAG_PROMISED_ANSWER => {
            let (question_id, transform) =
                parse_promised_answer(target.get_ptr(&schema::target::PROMISED_ANSWER)?)?;
            Ok(WireTarget::PromisedAnswer {
                question_id,
                transform,
            })
        }
        other => Err(RpcError::Unimplemented(format!("message target tag {other}"))),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_promised_answer(pa_ref: Ref) -> RpcResult<(QuestionId, Vec<u16>)> {
    let pa = Object::with_ref(pa_ref, schema::promised_answer::SIZE);
    let question_id = pa.get_data(&schema::promised_answer::QUESTION_ID) as u32;
    let transform_list = pa.get_ptr(&schema::promised_answer::TRANSFORM)?;
    let mut transform = Vec::new();
    for view in transform_list.read_list()? {
        let ElemView::Struct(op_ref) = view else {
            return Err(rpc_impl_err!("transform list with non-struct elements"));
        };
        let op = Object::with_ref(op_ref, schema::promised_answer::OP_SIZE);
        match op.get_data(&schema::promised_answer::OP_TAG) {
            schema::promised_answer::OP_NOOP => {}
            schema::promised_answer::OP_GET_POINTER_FIELD => {
                transform.push(op.get_data(&schema::promised_answer::OP_FIELD) as u16);
            }
            other => {
                return Err(RpcError::Unimplemented(format!("transform op {other}")));
            }
        }
    }
    Ok((question_id, transform))
}

#[allow(clippy::cast_possible_truncation)]
fn parse_payload(payload_ref: Ref) -> RpcResult<WirePayload> {
    let payload = Object::with_ref(payload_ref, schema::payload::SIZE);
    let root = payload.get_ptr(&schema::payload::CONTENT)?;
    let mut cap_table = Vec::new();
    for view in payload.get_ptr(&schema::payload::CAP_TABLE)?.read_list()? {
        let ElemView::Struct(desc_ref) = view else {
            return Err(rpc_impl_err!("cap table with non-struct elements"));
        };
        let desc = Object::with_ref(desc_ref, schema::cap_descriptor::SIZE);
        let id = desc.get_data(&schema::cap_descriptor::ID) as u32;
        cap_table.push(match desc.get_data(&schema::cap_descriptor::TAG) {
            schema::cap_descriptor::TAG_NONE => WireCapDescriptor::None,
            schema::cap_descriptor::TAG_SENDER_HOSTED => WireCapDescriptor::SenderHosted(id),
            schema::cap_descriptor::TAG_SENDER_PROMISE => WireCapDescriptor::SenderPromise(id),
            schema::cap_descriptor::TAG_RECEIVER_HOSTED => WireCapDescriptor::ReceiverHosted(id),
            schema::cap_descriptor::TAG_RECEIVER_ANSWER => {
                let (question_id, transform) = parse_promised_answer(
                    desc.get_ptr(&schema::cap_descriptor::RECEIVER_ANSWER)?,
                )?;
                WireCapDescriptor::ReceiverAnswer {
                    question_id,
                    transform,
                }
            }
            // level 3; recorded, the vat decides how to surface it
            schema::cap_descriptor::TAG_THIRD_PARTY_HOSTED => WireCapDescriptor::ThirdPartyHosted,
            other => {
                return Err(RpcError::Unimplemented(format!("cap descriptor tag {other}")));
            }
        });
    }
    Ok(WirePayload { root, cap_table })
}

// ---------------------------------------------------------------
// build
// ---------------------------------------------------------------

fn new_message(first_words: u32, tag: u64) -> RpcResult<(AmSegments, Object)> {
    let data = SegmentStore::with_first_segment_words(first_words).into_shared();
    let msg = {
        let root = Ref::alloc_root(&data, schema::MESSAGE)?;
        Object::with_ref(root, schema::MESSAGE)
    };
    msg.set_data(&schema::message::TAG, tag)?;
    Ok((data, msg))
}

fn frame(data: &AmSegments) -> RpcResult<Vec<u8>> {
    let store = data
        .lock()
        .map_err(|_| rpc_impl_err!("message store poisoned"))?;
    Ok(emit_message(&store.segments())?)
}

fn write_promised_answer(
    parent: &Object,
    field: &capwire::PtrField,
    question_id: QuestionId,
    transform: &[u16],
) -> RpcResult<()> {
    let pa = parent.init_struct(field, schema::promised_answer::SIZE)?;
    pa.set_data(&schema::promised_answer::QUESTION_ID, u64::from(question_id))?;
    if transform.is_empty() {
        return Ok(());
    }
    let count = u32::try_from(transform.len()).map_err(|_| rpc_usage_err!("transform length"))?;
    let ops = pa.init_struct_list(
        &schema::promised_answer::TRANSFORM,
        count,
        schema::promised_answer::OP_SIZE,
    )?;
    for (i, step) in transform.iter().enumerate() {
        let ElemView::Struct(op_ref) = ops.list_elem(u32::try_from(i).unwrap_or(u32::MAX))? else {
            return Err(rpc_impl_err!("freshly built transform list is not composite"));
        };
        let op = Object::with_ref(op_ref, schema::promised_answer::OP_SIZE);
        op.set_data(
            &schema::promised_answer::OP_TAG,
            schema::promised_answer::OP_GET_POINTER_FIELD,
        )?;
        op.set_data(&schema::promised_answer::OP_FIELD, u64::from(*step))?;
    }
    Ok(())
}

fn write_payload(
    parent: &Object,
    field: &capwire::PtrField,
    content: &Ref,
    cap_table: &[WireCapDescriptor],
) -> RpcResult<()> {
    let payload = parent.init_struct(field, schema::payload::SIZE)?;
    payload.adopt(&schema::payload::CONTENT, content)?;
    if cap_table.is_empty() {
        return Ok(());
    }
    let count = u32::try_from(cap_table.len()).map_err(|_| rpc_usage_err!("cap table length"))?;
    let list = payload.init_struct_list(
        &schema::payload::CAP_TABLE,
        count,
        schema::cap_descriptor::SIZE,
    )?;
    for (i, descriptor) in cap_table.iter().enumerate() {
        let ElemView::Struct(desc_ref) = list.list_elem(u32::try_from(i).unwrap_or(u32::MAX))?
        else {
            return Err(rpc_impl_err!("freshly built cap table is not composite"));
        };
        let desc = Object::with_ref(desc_ref, schema::cap_descriptor::SIZE);
        match descriptor {
            WireCapDescriptor::None => {
                desc.set_data(&schema::cap_descriptor::TAG, schema::cap_descriptor::TAG_NONE)?;
            }
            WireCapDescriptor::SenderHosted(id) => {
                desc.set_data(
                    &schema::cap_descriptor::TAG,
                    schema::cap_descriptor::TAG_SENDER_HOSTED,
                )?;
                desc.set_data(&schema::cap_descriptor::ID, u64::from(*id))?;
            }
            WireCapDescriptor::SenderPromise(id) => {
                desc.set_data(
                    &schema::cap_descriptor::TAG,
                    schema::cap_descriptor::TAG_SENDER_PROMISE,
                )?;
                desc.set_data(&schema::cap_descriptor::ID, u64::from(*id))?;
            }
            WireCapDescriptor::ReceiverHosted(id) => {
                desc.set_data(
                    &schema::cap_descriptor::TAG,
                    schema::cap_descriptor::TAG_RECEIVER_HOSTED,
                )?;
                desc.set_data(&schema::cap_descriptor::ID, u64::from(*id))?;
            }
            WireCapDescriptor::ReceiverAnswer {
                question_id,
                transform,
            } => {
                desc.set_data(
                    &schema::cap_descriptor::TAG,
                    schema::cap_descriptor::TAG_RECEIVER_ANSWER,
                )?;
                write_promised_answer(
                    &desc,
                    &schema::cap_descriptor::RECEIVER_ANSWER,
                    *question_id,
                    transform,
                )?;
            }
            WireCapDescriptor::ThirdPartyHosted => {
                desc.set_data(
                    &schema::cap_descriptor::TAG,
                    schema::cap_descriptor::TAG_THIRD_PARTY_HOSTED,
                )?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_call(
    first_words: u32,
    question_id: QuestionId,
    interface_id: u64,
    method_id: u16,
    target: &WireTarget,
    params_root: &Ref,
    cap_table: &[WireCapDescriptor],
) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::CALL)?;
    let call = msg.init_struct(&schema::message::BODY, schema::call::SIZE)?;
    call.set_data(&schema::call::QUESTION_ID, u64::from(question_id))?;
    call.set_data(&schema::call::METHOD_ID, u64::from(method_id))?;
    call.set_data(&schema::call::INTERFACE_ID, interface_id)?;

    let tgt = call.init_struct(&schema::call::TARGET, schema::target::SIZE)?;
    match target {
        WireTarget::ImportedCap(id) => {
            tgt.set_data(&schema::target::TAG, schema::target::TAG_IMPORTED_CAP)?;
            tgt.set_data(&schema::target::IMPORTED_CAP, u64::from(*id))?;
        }
        WireTarget::PromisedAnswer {
            question_id,
            transform,
        } => {
            tgt.set_data(&schema::target::TAG, schema::target::TAG_PROMISED_ANSWER)?;
            write_promised_answer(
                &tgt,
                &schema::target::PROMISED_ANSWER,
                *question_id,
                transform,
            )?;
        }
    }
    write_payload(&call, &schema::call::PARAMS, params_root, cap_table)?;
    frame(&data)
}

pub(crate) fn build_return_results(
    first_words: u32,
    answer_id: AnswerId,
    release_param_caps: bool,
    results_root: &Ref,
    cap_table: &[WireCapDescriptor],
) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::RETURN)?;
    let ret = msg.init_struct(&schema::message::BODY, schema::ret::SIZE)?;
    ret.set_data(&schema::ret::ANSWER_ID, u64::from(answer_id))?;
    ret.set_bool(&schema::ret::RELEASE_PARAM_CAPS, release_param_caps)?;
    ret.set_data(&schema::ret::TAG, schema::ret::TAG_RESULTS)?;
    write_payload(&ret, &schema::ret::BODY, results_root, cap_table)?;
    frame(&data)
}

pub(crate) fn build_return_exception(
    first_words: u32,
    answer_id: AnswerId,
    reason: &str,
) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::RETURN)?;
    let ret = msg.init_struct(&schema::message::BODY, schema::ret::SIZE)?;
    ret.set_data(&schema::ret::ANSWER_ID, u64::from(answer_id))?;
    ret.set_bool(&schema::ret::RELEASE_PARAM_CAPS, true)?;
    ret.set_data(&schema::ret::TAG, schema::ret::TAG_EXCEPTION)?;
    let exc = ret.init_struct(&schema::ret::BODY, schema::exception::SIZE)?;
    exc.set_data(&schema::exception::TYPE, schema::exception::TYPE_FAILED)?;
    exc.set_text(&schema::exception::REASON, reason)?;
    frame(&data)
}

pub(crate) fn build_return_canceled(first_words: u32, answer_id: AnswerId) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::RETURN)?;
    let ret = msg.init_struct(&schema::message::BODY, schema::ret::SIZE)?;
    ret.set_data(&schema::ret::ANSWER_ID, u64::from(answer_id))?;
    ret.set_bool(&schema::ret::RELEASE_PARAM_CAPS, true)?;
    ret.set_data(&schema::ret::TAG, schema::ret::TAG_CANCELED)?;
    frame(&data)
}

pub(crate) fn build_finish(
    first_words: u32,
    question_id: QuestionId,
    release_result_caps: bool,
) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::FINISH)?;
    let finish = msg.init_struct(&schema::message::BODY, schema::finish::SIZE)?;
    finish.set_data(&schema::finish::QUESTION_ID, u64::from(question_id))?;
    finish.set_bool(&schema::finish::RELEASE_RESULT_CAPS, release_result_caps)?;
    frame(&data)
}

pub(crate) fn build_release(first_words: u32, id: u32, count: u32) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::RELEASE)?;
    let release = msg.init_struct(&schema::message::BODY, schema::release::SIZE)?;
    release.set_data(&schema::release::ID, u64::from(id))?;
    release.set_data(&schema::release::REFERENCE_COUNT, u64::from(count))?;
    frame(&data)
}

pub(crate) fn build_restore(
    first_words: u32,
    question_id: QuestionId,
    object_id: &str,
) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::RESTORE)?;
    let restore = msg.init_struct(&schema::message::BODY, schema::restore::SIZE)?;
    restore.set_data(&schema::restore::QUESTION_ID, u64::from(question_id))?;
    restore.set_text(&schema::restore::OBJECT_ID, object_id)?;
    frame(&data)
}

pub(crate) fn build_abort(first_words: u32, reason: &str) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::ABORT)?;
    let exc = msg.init_struct(&schema::message::BODY, schema::exception::SIZE)?;
    exc.set_data(&schema::exception::TYPE, schema::exception::TYPE_FAILED)?;
    exc.set_text(&schema::exception::REASON, reason)?;
    frame(&data)
}

/// Echoes a message we did not understand back inside `unimplemented`.
pub(crate) fn build_unimplemented(first_words: u32, original: &Ref) -> RpcResult<Vec<u8>> {
    let (data, msg) = new_message(first_words, schema::message::UNIMPLEMENTED)?;
    msg.adopt(&schema::message::BODY, original)?;
    frame(&data)
}

#[cfg(test)]
mod test {
    use super::{
        build_call, build_finish, build_release, build_restore, build_return_results,
        parse_message, RpcMessage, WireCapDescriptor, WireReturn, WireTarget,
    };
    use capwire::{DataField, FrameParser, Object, StructSize};

    const FIRST_WORDS: u32 = 64;

    fn unframe(wire: Vec<u8>) -> Vec<Vec<u8>> {
        let mut parser = FrameParser::default();
        let mut messages = parser.feed(&wire).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(parser.pending_len(), 0);
        messages.remove(0)
    }

    #[test]
    fn call_round_trip() {
        let params = Object::build(StructSize::new(1, 1)).unwrap();
        params.set_data(&DataField::new(0, 32), 456).unwrap();
        params.set_cap_index(&capwire::PtrField::new(0), 0).unwrap();

        let wire = build_call(
            FIRST_WORDS,
            7,
            0xABCD_EF01_2345_6789,
            2,
            &WireTarget::ImportedCap(3),
            params.reference(),
            &[WireCapDescriptor::SenderHosted(11)],
        )
        .unwrap();

        let RpcMessage::Call {
            question_id,
            interface_id,
            method_id,
            target,
            params,
        } = parse_message(unframe(wire)).unwrap()
        else {
            panic!("expected a call");
        };
        assert_eq!(question_id, 7);
        assert_eq!(interface_id, 0xABCD_EF01_2345_6789);
        assert_eq!(method_id, 2);
        assert_eq!(target, WireTarget::ImportedCap(3));
        assert_eq!(params.cap_table, vec![WireCapDescriptor::SenderHosted(11)]);
        let content = Object::with_ref(params.root, StructSize::new(1, 1));
        assert_eq!(content.get_data(&DataField::new(0, 32)), 456);
        assert_eq!(
            content.get_cap_index(&capwire::PtrField::new(0)).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn pipelined_call_target_round_trip() {
        let params = Object::build(StructSize::new(0, 0)).unwrap();
        let wire = build_call(
            FIRST_WORDS,
            8,
            1,
            0,
            &WireTarget::PromisedAnswer {
                question_id: 5,
                transform: vec![0, 2],
            },
            params.reference(),
            &[],
        )
        .unwrap();

        let RpcMessage::Call { target, .. } = parse_message(unframe(wire)).unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(
            target,
            WireTarget::PromisedAnswer {
                question_id: 5,
                transform: vec![0, 2]
            }
        );
    }

    #[test]
    fn return_with_receiver_answer_descriptor() {
        let results = Object::build(StructSize::new(0, 1)).unwrap();
        results.set_cap_index(&capwire::PtrField::new(0), 0).unwrap();
        let wire = build_return_results(
            FIRST_WORDS,
            3,
            true,
            results.reference(),
            &[WireCapDescriptor::ReceiverAnswer {
                question_id: 9,
                transform: vec![1],
            }],
        )
        .unwrap();

        let RpcMessage::Return {
            answer_id,
            release_param_caps,
            body: WireReturn::Results(payload),
        } = parse_message(unframe(wire)).unwrap()
        else {
            panic!("expected results");
        };
        assert_eq!(answer_id, 3);
        assert!(release_param_caps);
        assert_eq!(
            payload.cap_table,
            vec![WireCapDescriptor::ReceiverAnswer {
                question_id: 9,
                transform: vec![1]
            }]
        );
    }

    #[test]
    fn bookkeeping_messages_round_trip() {
        let RpcMessage::Finish {
            question_id,
            release_result_caps,
        } = parse_message(unframe(build_finish(FIRST_WORDS, 21, true).unwrap())).unwrap()
        else {
            panic!("expected finish");
        };
        assert_eq!(question_id, 21);
        assert!(release_result_caps);

        let RpcMessage::Release {
            id,
            reference_count,
        } = parse_message(unframe(build_release(FIRST_WORDS, 4, 2).unwrap())).unwrap()
        else {
            panic!("expected release");
        };
        assert_eq!((id, reference_count), (4, 2));

        let RpcMessage::Restore {
            question_id,
            object_id,
        } = parse_message(unframe(build_restore(FIRST_WORDS, 1, "calculator").unwrap())).unwrap()
        else {
            panic!("expected restore");
        };
        assert_eq!(question_id, 1);
        assert_eq!(object_id, "calculator");
    }

    #[test]
    fn unknown_tags_are_preserved_for_the_echo() {
        use crate::rpc_schema as schema;

        // hand-build a message with the `resolve` tag
        let data = capwire::SegmentStore::new().into_shared();
        let root = capwire::Ref::alloc_root(&data, schema::MESSAGE).unwrap();
        let msg = Object::with_ref(root, schema::MESSAGE);
        msg.set_data(&schema::message::TAG, schema::message::RESOLVE)
            .unwrap();
        let wire = {
            let store = data.lock().unwrap();
            capwire::emit_message(&store.segments()).unwrap()
        };

        let RpcMessage::Other { tag, root } = parse_message(unframe(wire)).unwrap() else {
            panic!("expected the fall-through variant");
        };
        assert_eq!(u64::from(tag), schema::message::RESOLVE);

        let echo = super::build_unimplemented(FIRST_WORDS, &root).unwrap();
        let RpcMessage::Unimplemented { echoed } = parse_message(unframe(echo)).unwrap() else {
            panic!("expected unimplemented");
        };
        let echoed = Object::with_ref(echoed, schema::MESSAGE);
        assert_eq!(
            echoed.get_data(&schema::message::TAG),
            schema::message::RESOLVE
        );
    }
}
