//! Flow graph model and the simplified workspace YAML codec.
//!
//! A workspace document consists of:
//! - Requests: reusable endpoint/header/body definitions
//! - Environments: named variable sets chosen at run time
//! - Flows: ordered steps wired into a graph

mod export;
mod layout;
mod parser;
mod types;
mod validator;

pub use export::{export_workspace, to_document};
pub use layout::{compute_levels, layout_flow};
pub use parser::{
    build_bundle, import_workspace, import_workspace_file, parse_document, EnvironmentDef,
    FlowDef, ForEachStep, ForStep, IfStep, JsStep, RequestDef, RequestStep, SimplifiedWorkspace,
    Step, VariableDef, START_NODE_NAME,
};
pub use types::*;
pub use validator::{reachable_from, validate_flow};
