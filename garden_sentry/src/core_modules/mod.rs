// THEORY:
// The core modules are the engine's building blocks, leaves first: the connector
// port, the pure presence evaluator, artifact naming, the segmented writer and the
// hysteresis recorder that drives it. None of them knows about the others' policy;
// the supervisor is the only place they are wired together.

pub mod connector;
pub mod naming;
pub mod presence;
pub mod recorder;
pub mod segment_writer;
