//! HALO Classification Server
//!
//! Answers trigger requests from the edge node: grabs a frame from the
//! webcam, classifies it as metal, paper or plastic, records the result and
//! replies with the sort token the edge acts on.
//!
//! ## Features
//!
//! - **Exclusive camera lease**: one capture at a time, released on every
//!   exit path
//! - **Pluggable classifier**: remote inference over HTTP, or any
//!   [`Classifier`] implementation injected at start-up
//! - **Event history**: PostgreSQL or in-memory store with read-only query
//!   endpoints for the dashboard
//! - **Ad-hoc classification** of uploaded images
//!
//! ## Architecture
//!
//! ```text
//!  edge ── POST /run ──▶ RequestHandler
//!                          │
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//!   ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!   │ Capture      │ │ Classification│ │ Event        │
//!   │ Service      │ │ Service       │ │ Store        │
//!   └──────────────┘ └──────────────┘ └──────────────┘
//!          │               │                ▲
//!          ▼               ▼                │
//!      GstCamera     HttpClassifier    GET /api/v1/events
//! ```

pub mod api;
pub mod camera_gst;
pub mod capture;
pub mod classification;
pub mod config;
pub mod event_store;
pub mod handler;
pub mod testing;

pub use api::{create_router, start_api_server, AppState};
pub use capture::{CameraDevice, CaptureError, CaptureService, CaptureSettings, CapturedFrame, FrameArchive};
pub use classification::{Classification, ClassificationService, Classifier, ClassifierError, HttpClassifier, ModelInput};
pub use config::Config;
pub use event_store::{ClassificationEvent, EventQuery, EventStore, InMemoryEventStore, LabelCount, PgEventStore, StoreError};
pub use handler::{HandlerError, RequestHandler, RequestPhase, SortReply};
