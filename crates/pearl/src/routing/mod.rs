//! Request routing: priority rules over classifications, account registry
//! with monthly budgets, and the router that ties them together.

pub mod accounts;
pub mod router;
pub mod rules;

pub use accounts::{Account, AccountRegistry, AuthKind, Provider};
pub use router::{AccountRouter, RouteOptions, RoutingResult};
pub use rules::{MatchConditions, Rule, RuleEngine, TokenCond};
