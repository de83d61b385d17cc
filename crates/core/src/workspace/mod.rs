//! Geodata database layout and workspaces.
//!
//! ```text
//! <database>/<location>/PERMANENT/DEFAULT_WIND   location default region
//! <database>/<location>/<mapset>/WIND            mapset region
//! <database>/<location>/<mapset>/cell/<name>     raster maps
//! <database>/<location>/<mapset>/vector/<name>   vector maps
//! ```
//!
//! Ephemeral jobs run in a throwaway copy of this layout; persistent jobs
//! run directly in a mapset of the real database.

pub mod error;
pub mod manager;
pub mod region;

pub use error::{WorkspaceError, WorkspaceResult};
pub use manager::{check_name, Workspace, WorkspaceEnv, WorkspaceManager, PERMANENT};
pub use region::Region;
