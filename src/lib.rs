pub mod allow_list;
pub mod capture;
pub mod cli;
pub mod config;
pub mod detect;
pub mod display;
pub mod ipc;
pub mod lifecycle;
pub mod pipeline;
pub mod relay;
pub mod source;
pub mod store;
pub mod summary;
pub mod worker;
pub mod yolo;

pub use cli::{execute, exit_code, run_cli, Cli, Commands, ConfigArgs, RunArgs};
pub use config::{load_config, save_config, Config};
pub use source::SourceId;
pub use store::CountStore;
