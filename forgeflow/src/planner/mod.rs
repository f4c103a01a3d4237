//! Workflow planning: DAG construction and inter-step data mapping.

pub mod dag_builder;
pub mod mapper;

pub use dag_builder::{build_dag, fallback_dag, PlannedDag};
pub use mapper::{map_data_flows, validate_references};
