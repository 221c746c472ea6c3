//! Process roles.
//!
//! One binary, two roles: the `monitor` singleton turns new broadcaster
//! requests into bus messages; `broadcast` workers pull those messages and
//! run the sessions. The registry maps the CLI role name to its entry
//! point; unknown names fail before any backend is touched.

pub mod broadcast;
pub mod monitor;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub type RoleFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type RoleFn = fn(AppState, CancellationToken) -> RoleFuture;

pub const DEFAULT_ROLE: &str = "monitor";

pub fn registry() -> HashMap<&'static str, RoleFn> {
    let mut roles: HashMap<&'static str, RoleFn> = HashMap::new();
    roles.insert("monitor", |state, cancel| {
        Box::pin(monitor::run(state, cancel))
    });
    roles.insert("broadcast", |state, cancel| {
        Box::pin(broadcast::run(state, cancel))
    });
    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_both_roles_and_rejects_strangers() {
        let roles = registry();
        assert!(roles.contains_key("monitor"));
        assert!(roles.contains_key("broadcast"));
        assert!(!roles.contains_key("transcode"));
    }
}
