pub mod bus;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod history;
pub mod planning;
pub mod server;
pub mod tasks;
pub mod tool_call;

pub use bus::{BusError, Drain, EventBus};
pub use context::AppContext;
pub use dispatcher::{
    AckStatus, Acknowledgement, DEFAULT_SESSION_ID, DEFAULT_SYSTEM_PROMPT, DispatchError,
    DispatchState, RequestDispatcher,
};
pub use events::{Event, EventKind};
pub use history::{FileHistoryStore, HistoryEntry, HistoryStore, MemoryHistoryStore};
pub use planning::PlanningWorkflow;
pub use server::sandbox_api::run_sandbox_api;
pub use server::{build_router, run_server, serve};
pub use tasks::TaskRegistry;
pub use tool_call::{DecisionError, ToolCall, parse_decision};
