//! 基础设施层（Infrastructure）
//!
//! 持有稀缺资源（请求额度），只暴露能力。

pub mod ticket_broker;

pub use ticket_broker::{RateBudget, RefillOutcome, Ticket, TicketBroker, TicketError, TicketKind};
