//! hookrelay: a multi-provider source-control webhook gateway.
//!
//! The ingress side verifies GitHub/GitLab/Bitbucket deliveries, flattens
//! their payloads, evaluates a declarative rule set and fans matching
//! events out to one or more message brokers. The worker side joins broker
//! subscriptions into a single stream and dispatches decoded events to
//! user handlers under a concurrency and retry policy.

pub mod broker;
pub mod config;
pub mod event;
pub mod expr;
pub mod flatten;
pub mod github_auth;
pub mod metrics;
pub mod providers;
pub mod publish;
pub mod ratelimit;
pub mod rules;
pub mod server;
pub mod subscribe;
pub mod worker;
