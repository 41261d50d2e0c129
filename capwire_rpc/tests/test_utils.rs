// advisable because not all test modules use all functions of this module:
#![allow(dead_code)]

use async_trait::async_trait;
use capwire::{DataField, MethodDescriptor, PtrField, StructSize};
use capwire_rpc::{
    byte_channel_pair, CapDispatch, Capability, LocalRegistry, Payload, Restorer, RpcError,
    RpcResult, Vat, VatConfiguration,
};
use flexi_logger::{opt_format, Logger, LoggerHandle};
use std::sync::Arc;

// Returns a logger that prints out all info, warn and error messages.
pub fn init_logger() -> LoggerHandle {
    Logger::try_with_env_or_str("info")
        .unwrap()
        .format(opt_format)
        .start()
        .unwrap_or_else(|e| panic!("Logger initialization failed with {e}"))
}

// ---------------------------------------------------------------
// the test service: an adder that can hand out a worker capability
// ---------------------------------------------------------------

pub const ADDER_INTERFACE: u64 = 0xBEEF_0001;
pub const WORKER_INTERFACE: u64 = 0xBEEF_0002;

pub const ADD_PARAMS: StructSize = StructSize::new(1, 0);
pub const F_A: DataField = DataField::new(0, 32);
pub const F_B: DataField = DataField::new(32, 32);

pub const ADD_RESULTS: StructSize = StructSize::new(1, 0);
pub const F_SUM: DataField = DataField::new(0, 32);

pub const CAP_RESULTS: StructSize = StructSize::new(0, 1);
pub const F_CAP: PtrField = PtrField::new(0);

pub const DELEGATE_PARAMS: StructSize = StructSize::new(1, 1);

pub fn add_method() -> MethodDescriptor {
    MethodDescriptor {
        interface_id: ADDER_INTERFACE,
        method_id: 0,
        param_size: ADD_PARAMS,
        result_size: ADD_RESULTS,
    }
}

pub fn get_worker_method() -> MethodDescriptor {
    MethodDescriptor {
        interface_id: ADDER_INTERFACE,
        method_id: 1,
        param_size: StructSize::new(0, 0),
        result_size: CAP_RESULTS,
    }
}

/// Calls the worker passed at pointer 0 and relays its answer.
pub fn delegate_method() -> MethodDescriptor {
    MethodDescriptor {
        interface_id: ADDER_INTERFACE,
        method_id: 2,
        param_size: DELEGATE_PARAMS,
        result_size: ADD_RESULTS,
    }
}

pub fn worker_add_method() -> MethodDescriptor {
    MethodDescriptor {
        interface_id: WORKER_INTERFACE,
        method_id: 0,
        param_size: ADD_PARAMS,
        result_size: ADD_RESULTS,
    }
}

/// Sleeps before answering; for timeout and cancellation tests.
pub fn worker_slow_method() -> MethodDescriptor {
    MethodDescriptor {
        interface_id: WORKER_INTERFACE,
        method_id: 1,
        param_size: StructSize::new(0, 0),
        result_size: ADD_RESULTS,
    }
}

#[derive(Debug)]
pub struct Worker;

#[async_trait]
impl CapDispatch for Worker {
    async fn dispatch(
        &self,
        _interface_id: u64,
        method_id: u16,
        params: Payload,
        _vat: Vat,
    ) -> RpcResult<Payload> {
        match method_id {
            0 => {
                let p = params.object(ADD_PARAMS);
                let (payload, results) = Payload::build(ADD_RESULTS)?;
                results.set_data(&F_SUM, p.get_data(&F_A) + p.get_data(&F_B))?;
                Ok(payload)
            }
            1 => {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                let (payload, results) = Payload::build(ADD_RESULTS)?;
                results.set_data(&F_SUM, 42)?;
                Ok(payload)
            }
            other => Err(RpcError::Unimplemented(format!("worker method {other}"))),
        }
    }
}

#[derive(Debug)]
pub struct Adder {
    pub worker: u32,
}

#[async_trait]
impl CapDispatch for Adder {
    async fn dispatch(
        &self,
        _interface_id: u64,
        method_id: u16,
        params: Payload,
        vat: Vat,
    ) -> RpcResult<Payload> {
        match method_id {
            0 => {
                let p = params.object(ADD_PARAMS);
                let (payload, results) = Payload::build(ADD_RESULTS)?;
                results.set_data(&F_SUM, p.get_data(&F_A) + p.get_data(&F_B))?;
                Ok(payload)
            }
            1 => {
                let (mut payload, results) = Payload::build(CAP_RESULTS)?;
                let index = payload.add_cap(Capability::Local { id: self.worker });
                results.set_cap_index(&F_CAP, index)?;
                Ok(payload)
            }
            2 => {
                // relay through the capability the caller passed at ptr 0
                let target = params.resolve_transform(&[0])?;
                let p = params.object(DELEGATE_PARAMS);
                let (forward, forward_params) = Payload::build(ADD_PARAMS)?;
                forward_params.set_data(&F_A, p.get_data(&F_A))?;
                forward_params.set_data(&F_B, p.get_data(&F_B))?;
                let pending = vat.call(target, worker_add_method(), forward).await?;
                let answer = pending.wait(None).await?;

                let sum = answer.object(ADD_RESULTS).get_data(&F_SUM);
                let (payload, results) = Payload::build(ADD_RESULTS)?;
                results.set_data(&F_SUM, sum)?;
                Ok(payload)
            }
            other => Err(RpcError::Unimplemented(format!("adder method {other}"))),
        }
    }
}

#[derive(Debug)]
pub struct AdderRestorer {
    pub adder: u32,
}

#[async_trait]
impl Restorer for AdderRestorer {
    async fn restore(&self, object_id: &str, _vat: Vat) -> RpcResult<Capability> {
        match object_id {
            "adder" => Ok(Capability::Local { id: self.adder }),
            other => Err(RpcError::Unimplemented(format!("no object named {other}"))),
        }
    }
}

/// A connected client/server pair; the server publishes "adder".
pub fn connect_pair() -> (Vat, Vat) {
    connect_pair_with(VatConfiguration::default())
}

pub fn connect_pair_with(config: VatConfiguration) -> (Vat, Vat) {
    let ((client_transport, client_rx), (server_transport, server_rx)) = byte_channel_pair();

    let mut locals = LocalRegistry::new();
    let worker = locals.add(Arc::new(Worker));
    let adder = locals.add(Arc::new(Adder { worker }));
    let server = Vat::spawn(
        config,
        Box::new(server_transport),
        locals,
        Some(Arc::new(AdderRestorer { adder })),
    );
    server.pump(server_rx);

    let client = Vat::spawn(config, Box::new(client_transport), LocalRegistry::new(), None);
    client.pump(client_rx);

    (client, server)
}
