//! Conflict extraction and resolution
//!
//! Runs over the revision collation only:
//!
//! 1. [`constraints`]: safety agents' constraint text becomes typed
//!    [`BindingConstraint`]s.
//! 2. [`detect`]: every pair of successful responses is checked for
//!    safety-vs-business, safety-vs-safety and business-vs-business conflicts.
//! 3. [`resolve`]: fixed-priority rules decide each conflict and produce the
//!    active constraint set that arbitration must honor.

pub mod constraints;
pub mod detect;
pub mod resolve;

pub use constraints::{
    extract_constraints, parse_duration_hours, performs_action, proposed_delay, BindingConstraint,
    ConstraintKind,
};
pub use detect::{
    classify_course, detect_conflicts, Conflict, ConflictType, CourseOfAction, ProposedCourse,
    Severity,
};
pub use resolve::{resolve, ConflictResolution, ResolutionRule, ResolvedConstraints, SafetyOverride};
