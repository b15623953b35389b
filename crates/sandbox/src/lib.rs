//! Sandbox backends for Codebox.
//!
//! A backend owns the isolation boundary of one session and runs code
//! blocks against the session's namespace. Three variants exist:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Session Manager                                           │
//! │    ↓ run_block(namespace, block, ctl)                      │
//! ├──────────────────────┬─────────────────────────────────────┤
//! │  InProcessBackend    │  IsolatedBackend                    │
//! │    interpreter on a  │    snapshot + job → runner → outcome│
//! │    blocking thread   │      ↓ SandboxEngine                │
//! │    ↓ ChannelPort     │  DockerEngine     RemoteEngine      │
//! │                      │  (bollard)        (HTTP service)    │
//! │                      │      ↓ TcpQueryPort                 │
//! ├──────────────────────┴─────────────────────────────────────┤
//! │  BridgeChannel → QueryHandler → model backend              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Isolated sandboxes never see host memory: the namespace crosses the
//! boundary as a JSON snapshot, and queries travel over the bridge's TCP
//! listener.

pub mod backend;
pub mod docker;
pub mod engine;
pub mod factory;
pub mod in_process;
pub mod isolated;
pub mod mock;
pub mod remote;

pub use backend::{BlockOutput, BlockRequest, CancelReason, ExecControl, SandboxBackend, Termination};
pub use docker::DockerEngine;
pub use engine::{ExecResult, SandboxEngine, SandboxId};
pub use factory::{BackendFactory, DefaultBackendFactory};
pub use in_process::{ChannelPort, InProcessBackend};
pub use isolated::{Advertise, IsolatedBackend, IsolatedOptions};
pub use mock::{MockBackend, MockEngine, MockStep};
pub use remote::RemoteEngine;
