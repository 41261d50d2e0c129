mod test_utils;

use capwire_rpc::{Payload, RpcError, RpcResult};
use log::info;
use test_utils::{add_method, ADD_PARAMS, ADD_RESULTS, F_A, F_B, F_SUM};

#[tokio::test] // cargo test --test test_050_rpc_round_trip -- --nocapture
async fn test_050_rpc_round_trip() -> RpcResult<()> {
    let _log_handle = test_utils::init_logger();
    let (client, server) = test_utils::connect_pair();

    let restore = client.restore("adder").await?;

    // pipeline a call onto the not-yet-restored capability
    let (params, p) = Payload::build(ADD_PARAMS)?;
    p.set_data(&F_A, 2)?;
    p.set_data(&F_B, 3)?;
    let pipelined = client
        .call(restore.pipeline(vec![0]), add_method(), params)
        .await?;
    let answer = pipelined.wait(None).await?;
    assert_eq!(answer.object(ADD_RESULTS).get_data(&F_SUM), 5);
    info!("pipelined add answered");

    // resolve the restored capability and call it directly
    let restored = restore.wait(None).await?;
    let adder = restored.resolve_transform(&[0])?;
    let (params, p) = Payload::build(ADD_PARAMS)?;
    p.set_data(&F_A, 10)?;
    p.set_data(&F_B, 20)?;
    let direct = client.call(adder.clone(), add_method(), params).await?;
    assert_eq!(
        direct.wait(None).await?.object(ADD_RESULTS).get_data(&F_SUM),
        30
    );

    // an unknown method comes back as a peer exception
    let bad_method = capwire::MethodDescriptor {
        method_id: 99,
        ..add_method()
    };
    let (params, _) = Payload::build(ADD_PARAMS)?;
    let failing = client.call(adder, bad_method, params).await?;
    match failing.wait(None).await {
        Err(RpcError::Peer(reason)) => assert!(reason.contains("99"), "got: {reason}"),
        other => panic!("expected a peer exception, got {other:?}"),
    }

    let client_stats = client.statistics().await?;
    let server_stats = server.statistics().await?;
    info!("client:\n{client_stats}");
    info!("server:\n{server_stats}");
    assert_eq!(client_stats.calls_sent(), 4); // restore + three calls
    assert_eq!(server_stats.calls_received(), 4);
    assert!(client_stats.messages_sent() >= 4);
    Ok(())
}
