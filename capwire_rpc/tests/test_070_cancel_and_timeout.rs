mod test_utils;

use capwire_rpc::{Payload, RpcError, RpcResult};
use capwire::StructSize;
use log::info;
use std::time::Duration;
use test_utils::{worker_slow_method, ADD_RESULTS, F_SUM};

#[tokio::test] // cargo test --test test_070_cancel_and_timeout -- --nocapture
async fn test_070_cancel_and_timeout() -> RpcResult<()> {
    let _log_handle = test_utils::init_logger();
    let (client, server) = test_utils::connect_pair();

    let restore = client.restore("adder").await?;
    let adder = restore.wait(None).await?.resolve_transform(&[0])?;
    let get_worker = client
        .call(adder, test_utils::get_worker_method(), Payload::build(StructSize::new(0, 0))?.0)
        .await?;
    let worker = get_worker.wait(None).await?.resolve_transform(&[0])?;

    // a timeout fails the wait, not the question
    let no_params = Payload::build(StructSize::new(0, 0))?.0;
    let slow = client
        .call(worker.clone(), worker_slow_method(), no_params)
        .await?;
    match slow.wait(Some(Duration::from_millis(50))).await {
        Err(RpcError::Timeout) => info!("first wait timed out as expected"),
        other => panic!("expected a timeout, got {other:?}"),
    }
    let answer = slow.wait(None).await?;
    assert_eq!(answer.object(ADD_RESULTS).get_data(&F_SUM), 42);

    // dropping the handle before the return cancels the question
    let no_params = Payload::build(StructSize::new(0, 0))?.0;
    let canceled = client
        .call(worker, worker_slow_method(), no_params)
        .await?;
    drop(canceled);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let server_stats = server.statistics().await?;
    info!("server after cancellation:\n{server_stats}");
    // the canceled answer is gone; restore, get_worker and slow are still held
    assert_eq!(server_stats.answers_open(), 3);
    let client_stats = client.statistics().await?;
    assert_eq!(client_stats.questions_open(), 3);

    // stopping the client aborts the peer
    client.stop().await;
    let (params, _) = Payload::build(StructSize::new(0, 0))?;
    match client
        .call(
            capwire_rpc::Capability::Remote { id: 0 },
            worker_slow_method(),
            params,
        )
        .await
    {
        Err(RpcError::Stopped) => {}
        other => panic!("expected Stopped, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (params, _) = Payload::build(StructSize::new(0, 0))?;
    match server
        .call(
            capwire_rpc::Capability::Remote { id: 0 },
            worker_slow_method(),
            params,
        )
        .await
    {
        Err(RpcError::Stopped) => {}
        other => panic!("expected the server to be stopped too, got {other:?}"),
    }
    Ok(())
}
