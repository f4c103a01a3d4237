//! Integration tests for the pipeline runner
//!
//! This suite drives the full state machine against scripted mocks:
//! - End-to-end scenarios (happy path, parallel plans, self-debug,
//!   budget exhaustion, clarification, security block)
//! - Checkpoint round-trip and resume
//! - Quantified invariants (event monotonicity, debug and tool budgets)

mod pipeline {
    mod common;
    mod test_checkpoint;
    mod test_invariants;
    mod test_scenarios;
}
