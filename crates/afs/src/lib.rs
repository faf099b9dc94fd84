//! AFS: an agent file system.
//!
//! AFS composes independent backends ("modules") into one path-addressed
//! namespace. Point operations go to the longest matching mount; `list`
//! and `search` fan out to every covering mount and merge the results.
//!
//! On top of the namespace sit two derived-content layers backed by a
//! SQLite metadata store:
//!
//! - **Views**: a read may ask for a projection of an entry (a translation,
//!   a rendered image). A registered driver produces it once, the result is
//!   cached and served until the source revision moves on.
//! - **Slots**: documents embed `<!-- afs:image ... -->` annotations. Each
//!   one resolves to an intent-addressed asset path, so identical
//!   descriptions across documents share a single generated asset.
//!
//! ```rust,ignore
//! use afs::{Afs, DocumentModule, ReadOptions, View};
//!
//! let docs = DocumentModule::builder("docs", "./docs").build()?;
//! let afs = Afs::builder().mount("/modules/docs", docs).build()?;
//! let fr = afs
//!     .read("/modules/docs/intro.md", &ReadOptions::view(View::language("fr")))
//!     .await?;
//! ```

mod config;
mod entry;
mod error;
mod events;
mod module;
mod router;
mod time;
mod view;

pub mod driver;
pub mod metadata;
pub mod modules;
pub mod path;
pub mod policy;
pub mod slots;

pub use config::{AfsConfig, MountConfig, MountKind};
pub use driver::{
    Driver, DriverCapabilities, DriverRegistry, EngineOptions, GenerationRequest, GenerationTask,
    Generator, InvocationContext,
};
pub use entry::{
    Content, DeleteOptions, Entry, EntryKind, ExecOptions, ExecResult, ListOptions, ListResult,
    OrderBy, OrderField, ReadOptions, ReadResult, RenameOptions, SearchOptions, UNBOUNDED_DEPTH,
    WaitStrategy, WriteOptions, WritePayload, WriteResult,
};
pub use error::{AfsError, DriverError, Result};
pub use events::{AfsEvent, EventBus};
pub use metadata::{MetadataStore, ViewState};
pub use module::{AccessMode, AfsModule, MountContext, RootHandle};
pub use modules::{DocumentModule, DocumentModuleBuilder, HistoryModule, MemoryModule};
pub use router::{Afs, AfsBuilder, MountInfo};
pub use view::{Dimension, View, ViewKey, normalize_view_key};
