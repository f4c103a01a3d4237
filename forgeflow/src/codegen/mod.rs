//! Code generation: the tool-calling agent, its tool set, the static
//! security review, and the smoke-test scaffold.

pub mod generator;
pub mod security;
pub mod test_scaffold;
pub mod tools;

pub use generator::{generate_workflow_code, CodegenError, CodegenOutput, ToolCallRecord};
pub use security::{scan, ScanConfig, SecurityCategory, SecurityFinding, SecurityReport, Severity};
pub use test_scaffold::generate_tests;
pub use tools::{tool_declarations, ToolContext};
