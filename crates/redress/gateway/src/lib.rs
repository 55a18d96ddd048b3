//! Typed client for the upstream payment gateway.
//!
//! The wire protocol is wrapped, not re-derived: this crate exposes the
//! essential calls (`charge`, `reconcile`, `void`, `page`,
//! `chargeback_detail`) with typed requests/responses and a closed status
//! mapping. Workers depend on the [`EmpGateway`] trait; the HTTP client
//! and the scriptable mock are interchangeable implementations.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod client;
mod http;
mod mock;

pub use client::{
    idempotency_key, ChargeRequest, ChargebackDetail, EmpGateway, GatewayError, GatewayOutcome,
    GatewayResult, GatewayStatus, TransactionPage, TransactionRecord,
};
pub use http::{HttpEmpGateway, HttpGatewayConfig};
pub use mock::MockGateway;

use std::sync::Arc;

/// Shared handle to the gateway implementation in use.
pub type GatewayHandle = Arc<dyn EmpGateway>;
