pub mod config;
pub mod error;
pub mod ids;

pub use config::{QuiverConfig, load_dotenv};
pub use error::{QuiverError, TaskError};
pub use ids::{GroupId, TaskId};
