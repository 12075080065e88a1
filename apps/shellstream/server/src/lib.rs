//! Ticketed remote exec over multiplexed websocket channels.

pub mod config;
pub mod pump;
pub mod runtime;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod ticket;

pub use config::{Cli, ServerConfig};
pub use runtime::{ExecRequest, ExitReport, ProcessRuntime, RunningTask, StdioPipes, TaskRuntime};
pub use server::{ExecServer, ExecTicket, RequestExecError};
pub use ticket::{Ticket, TicketCache, TicketConfig, TicketError};
