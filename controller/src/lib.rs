//! The controller: watches the node registry, projects each record into a
//! peer, aggregates pod prefixes, and fans the result out to the
//! packet-filter and VPN reconcilers. Also owns self-setup, the one-time
//! startup step that publishes this node's own annotations.

mod desired_state;
mod queue;
mod run;
mod selfsetup;
mod watcher;

pub use desired_state::{compute as compute_desired_state, DesiredState};
pub use queue::{WorkQueue, WorkQueueHandle, MAX_RETRIES};
pub use run::{reconcile_once, run_worker, KubeNodeRecordStore};
pub use selfsetup::{resolve_pod_cidrs, self_setup, NodeRecordStore, SelfSetupError};
pub use watcher::{run as run_watcher, NodeCache, SharedNodeCache, WatchError};
