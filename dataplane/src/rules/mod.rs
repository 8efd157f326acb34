//! Per-frontend rule sets.
//!
//! Rules are registered on every pass. A rule already known is kept, a new
//! one is created at the next refresh and one that was not registered again
//! is deleted. Creating or deleting a rule requires a reload.

mod rule;

pub use rule::*;

use crate::configuration::Configuration;
use crate::instance::Instance;
use crate::models::Mode;
use haproxy_ingress_core::utils::content_hash;
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use tracing::{debug, error};

/// Variable matched against rule ids in HTTP frontends.
pub const HTTP_ACL_VAR: &str = "txn.path_match";
/// Variable matched against rule ids in TCP frontends.
pub const TCP_ACL_VAR: &str = "txn.sni_match";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Created,
    ToCreate,
    ToDelete,
}

#[derive(Debug)]
struct RuleInfo {
    state: RuleState,
    ingress: bool,
}

#[derive(Default, Debug)]
struct RuleSet {
    rules: BTreeMap<RuleType, Vec<Rule>>,
    meta: BTreeMap<String, RuleInfo>,
}

/// Stable identifier of a rule: the hash of its type followed by its JSON
/// form. Rules only hold strings, numbers and flags, so serialization does
/// not fail; the debug form stands in should that ever change.
pub fn rule_id(rule: &Rule) -> String {
    let body = serde_json::to_string(rule).unwrap_or_else(|_| format!("{rule:?}"));
    content_hash(format!("{}{body}", rule.rule_type()).as_bytes())
}

#[derive(Default, Debug)]
pub struct SectionRules {
    frontends: BTreeMap<String, RuleSet>,
}

impl SectionRules {
    /// Registers `rule` on `frontend`. Returns the rule id.
    pub fn add_rule(&mut self, frontend: &str, rule: Rule, ingress: bool) -> String {
        let set = self.frontends.entry(frontend.to_string()).or_default();
        let id = rule_id(&rule);
        match set.meta.get_mut(&id) {
            Some(info) => info.state = RuleState::Created,
            None => {
                set.rules.entry(rule.rule_type()).or_default().push(rule);
                set.meta.insert(
                    id.clone(),
                    RuleInfo {
                        state: RuleState::ToCreate,
                        ingress: false,
                    },
                );
            }
        }
        if ingress {
            if let Some(info) = set.meta.get_mut(&id) {
                info.ingress = true;
            }
        }
        id
    }

    pub fn delete_frontend(&mut self, frontend: &str) {
        self.frontends.remove(frontend);
    }

    /// Marks every rule of `frontends` for deletion ahead of a new pass.
    pub fn clean(&mut self, frontends: &[&str]) {
        for frontend in frontends {
            if let Some(set) = self.frontends.get_mut(*frontend) {
                for info in set.meta.values_mut() {
                    info.state = RuleState::ToDelete;
                }
            }
        }
    }

    /// Rewrites the rules of every known frontend into `config`.
    pub fn refresh(&mut self, config: &mut Configuration, instance: &mut Instance) {
        config.userlists.clear();
        for (name, set) in &mut self.frontends {
            let Some(frontend) = config.frontends.get_mut(name) else {
                error!(frontend = %name, "frontend not found, rules skipped");
                continue;
            };
            frontend.clear_rules();
            let acl_var = if frontend.mode == Mode::Tcp {
                TCP_ACL_VAR
            } else {
                HTTP_ACL_VAR
            };

            for rule_type in RuleType::iter() {
                let Some(rules) = set.rules.get_mut(&rule_type) else {
                    continue;
                };
                let mut kept = Vec::with_capacity(rules.len());
                for rule in rules.drain(..) {
                    let id = rule_id(&rule);
                    let Some(info) = set.meta.get(&id) else {
                        continue;
                    };
                    if info.state == RuleState::ToDelete {
                        set.meta.remove(&id);
                        instance.reload(format!("HAProxy rule '{rule_type}' deleted"));
                        continue;
                    }
                    let ingress_acl = if info.ingress {
                        format!("{{ var({acl_var}) -m dom {id} }}")
                    } else {
                        String::new()
                    };
                    match rule.create(config, name, &ingress_acl) {
                        Ok(()) if info.state == RuleState::ToCreate => {
                            instance.reload(format!("New HAProxy rule '{rule_type}' created"));
                        }
                        Ok(()) => {}
                        Err(err) => error!("failed to create a {rule_type} rule: {err}"),
                    }
                    kept.push(rule);
                }
                *rules = kept;
            }
            debug!(frontend = %name, "Rules refreshed");
        }
    }
}
