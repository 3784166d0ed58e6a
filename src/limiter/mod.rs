pub mod breaker;
pub mod cache;
pub mod decision;
pub mod evaluator;
pub mod identifier;
pub mod rule;
pub mod store;
pub mod throttle;

pub use cache::CounterCache;
pub use decision::Decision;
pub use evaluator::{CompletionHook, DenialBodyFn, EvaluatedRule, Evaluation, KeyGeneratorFn, RuleSet};
pub use rule::{Algorithm, Rule, RuleScope};
pub use throttle::LocalThrottle;
