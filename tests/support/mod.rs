mod cli;
mod engine;
mod workspace;

pub use cli::{CliOutput, CliRunner};
pub use engine::{hover_markdown, FakeEngine};
pub use workspace::{TestProject, TestProjectBuilder, HELLO_CPP, HELLO_H, MAIN_CPP};
