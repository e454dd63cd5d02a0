//! Memory subsystems feeding the classifier: episodic (what happened before)
//! and procedural (what the user decreed).

mod episodic;
mod procedural;

pub use episodic::{Episode, EpisodicMemory, EpisodicSignal, UserCorrection};
pub use procedural::{
    Comparator, Condition, ProceduralMemory, ProceduralRule, RuleAction, RuleError, RuleMatch,
    RuleType,
};
