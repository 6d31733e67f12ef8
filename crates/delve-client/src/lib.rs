//! Client session stack: state caches, message routing, and the
//! [`GameClient`] composition root.

pub mod cache;
pub mod client;
pub mod clock;
pub mod correlation;
pub mod inventory;
pub mod missions;
pub mod notify;
pub mod requests;
pub mod router;
pub mod slots;

pub use cache::CacheView;
pub use client::{ClientError, ClientSettings, GameClient};
pub use clock::ClockOffset;
pub use correlation::{OperationKind, PendingCorrelations};
pub use inventory::Inventory;
pub use missions::{MissionBoard, Milestones};
pub use notify::{Correlated, Feed, Notifications, SessionEvent};
pub use requests::{RequestError, RequestSender};
pub use router::{CacheViews, RouteError, Router, RouterStats};
pub use slots::{Occupancy, SlotTable};
