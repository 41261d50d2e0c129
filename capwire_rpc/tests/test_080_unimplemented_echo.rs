mod test_utils;

use capwire::{emit_message, FrameParser, Object, Ref, SegmentStore};
use capwire_rpc::{rpc_schema as schema, LocalRegistry, RpcResult, Vat, VatConfiguration};
use capwire_rpc::byte_channel_pair;
use log::info;

// A vat that receives a message variant outside its level echoes it back
// inside `unimplemented` and keeps running.
#[tokio::test] // cargo test --test test_080_unimplemented_echo -- --nocapture
async fn test_080_unimplemented_echo() -> RpcResult<()> {
    let _log_handle = test_utils::init_logger();

    let ((our_transport, our_rx), (vat_transport, vat_rx)) = byte_channel_pair();
    drop(our_transport);
    let vat = Vat::spawn(
        VatConfiguration::default(),
        Box::new(vat_transport),
        LocalRegistry::new(),
        None,
    );
    vat.pump(vat_rx);

    // hand-build a `resolve` message, which this level does not speak
    let data = SegmentStore::new().into_shared();
    let root = Ref::alloc_root(&data, schema::MESSAGE)?;
    let msg = Object::with_ref(root, schema::MESSAGE);
    msg.set_data(&schema::message::TAG, schema::message::RESOLVE)?;
    let wire = {
        let store = data.lock().unwrap();
        emit_message(&store.segments())?
    };
    vat.feed(wire)?;

    // the echo carries our original message as its body
    let mut our_rx = our_rx;
    let echoed_bytes = our_rx.recv().await.expect("expected an echo");
    let mut parser = FrameParser::default();
    let mut messages = parser.feed(&echoed_bytes)?;
    assert_eq!(messages.len(), 1);
    let received = SegmentStore::from_segments(messages.remove(0))?.into_shared();
    let echo = Object::read_root(&received, schema::MESSAGE)?;
    assert_eq!(echo.get_data(&schema::message::TAG), schema::message::UNIMPLEMENTED);
    let original = Object::with_ref(echo.get_ptr(&schema::message::BODY)?, schema::MESSAGE);
    assert_eq!(original.get_data(&schema::message::TAG), schema::message::RESOLVE);
    info!("resolve was echoed back as unimplemented");

    // the session is still alive
    let stats = vat.statistics().await?;
    assert_eq!(stats.messages_received(), 1);
    assert_eq!(stats.messages_sent(), 1);
    Ok(())
}
