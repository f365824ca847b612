use std::fmt;

use serde_json::{Value, json};
use uuid::Uuid;

use super::Kernel;
use crate::command::{Command, Recipe};
use crate::dispatch::{HandlerError, OperationClass, normalize_action};
use crate::error::KernelError;
use crate::host::SceneHost;
use crate::registry::{Registration, RegistryError};

const DEFAULT_RECIPE_NAME: &str = "Recipe";

/// Kernel-owned tools. They need kernel state, so they are routed ahead of
/// the host handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Status,
    ListTools,
    ExecuteRecipe,
    TransactionBegin,
    TransactionCommit,
    TransactionAbort,
    RegistryAdd,
    RegistryList,
    RegistryGroup,
    RegistryResolve,
    RegistrySanitize,
    RegistrySave,
    RegistryLoad,
    GuardStatus,
    AuditVerify,
    HealthCheck,
    TelemetryErrors,
}

impl Builtin {
    pub const ALL: [Builtin; 17] = [
        Builtin::Status,
        Builtin::ListTools,
        Builtin::ExecuteRecipe,
        Builtin::TransactionBegin,
        Builtin::TransactionCommit,
        Builtin::TransactionAbort,
        Builtin::RegistryAdd,
        Builtin::RegistryList,
        Builtin::RegistryGroup,
        Builtin::RegistryResolve,
        Builtin::RegistrySanitize,
        Builtin::RegistrySave,
        Builtin::RegistryLoad,
        Builtin::GuardStatus,
        Builtin::AuditVerify,
        Builtin::HealthCheck,
        Builtin::TelemetryErrors,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Status => "status",
            Builtin::ListTools => "system/list-tools",
            Builtin::ExecuteRecipe => "system/execute-recipe",
            Builtin::TransactionBegin => "transaction/begin",
            Builtin::TransactionCommit => "transaction/commit",
            Builtin::TransactionAbort => "transaction/abort",
            Builtin::RegistryAdd => "registry/add",
            Builtin::RegistryList => "registry/list",
            Builtin::RegistryGroup => "registry/group",
            Builtin::RegistryResolve => "registry/resolve",
            Builtin::RegistrySanitize => "registry/sanitize",
            Builtin::RegistrySave => "registry/save",
            Builtin::RegistryLoad => "registry/load",
            Builtin::GuardStatus => "guard/status",
            Builtin::AuditVerify => "audit/verify",
            Builtin::HealthCheck => "health/check",
            Builtin::TelemetryErrors => "telemetry/get-errors",
        }
    }

    pub fn class(self) -> OperationClass {
        match self {
            Builtin::ExecuteRecipe
            | Builtin::TransactionBegin
            | Builtin::TransactionCommit
            | Builtin::TransactionAbort
            | Builtin::RegistryAdd
            | Builtin::RegistrySanitize
            | Builtin::RegistrySave
            | Builtin::RegistryLoad => OperationClass::Mutate,
            _ => OperationClass::Read,
        }
    }

    /// Resolves an action to a built-in, using the same folding as the
    /// handler table. The arms are the normalized forms of [`Builtin::name`].
    pub fn lookup(action: &str) -> Option<Builtin> {
        let builtin = match normalize_action(action).as_str() {
            "status" => Builtin::Status,
            "system/list/tools" => Builtin::ListTools,
            "system/execute/recipe" => Builtin::ExecuteRecipe,
            "transaction/begin" => Builtin::TransactionBegin,
            "transaction/commit" => Builtin::TransactionCommit,
            "transaction/abort" => Builtin::TransactionAbort,
            "registry/add" => Builtin::RegistryAdd,
            "registry/list" => Builtin::RegistryList,
            "registry/group" => Builtin::RegistryGroup,
            "registry/resolve" => Builtin::RegistryResolve,
            "registry/sanitize" => Builtin::RegistrySanitize,
            "registry/save" => Builtin::RegistrySave,
            "registry/load" => Builtin::RegistryLoad,
            "guard/status" => Builtin::GuardStatus,
            "audit/verify" => Builtin::AuditVerify,
            "health/check" => Builtin::HealthCheck,
            "telemetry/get/errors" => Builtin::TelemetryErrors,
            _ => return None,
        };
        Some(builtin)
    }

    /// Recipes run inside their own transaction; these would break it.
    fn allowed_in_recipe(self) -> bool {
        !matches!(
            self,
            Builtin::ExecuteRecipe
                | Builtin::TransactionBegin
                | Builtin::TransactionCommit
                | Builtin::TransactionAbort
        )
    }
}

fn failure(command: &Command, reason: impl fmt::Display) -> KernelError {
    KernelError::HandlerFailure {
        action: command.action().to_string(),
        reason: reason.to_string(),
    }
}

fn required<'c>(command: &'c Command, key: &str) -> Result<&'c str, KernelError> {
    command
        .arg(key)
        .ok_or_else(|| failure(command, HandlerError::MissingArgument(key.to_string())))
}

impl<H: SceneHost> Kernel<H> {
    pub(super) fn run_builtin(
        &mut self,
        builtin: Builtin,
        command: &Command,
    ) -> Result<Value, KernelError> {
        match builtin {
            Builtin::Status => Ok(json!({
                "status": "connected",
                "state": self.state,
                "transaction": self.transactions.current(),
                "registryEntries": self.registry.len(),
                "createdHandles": self.session.as_ref().map_or(0, |s| s.created_handles.len()),
            })),
            Builtin::ListTools => {
                let mut tools: Vec<&str> = Builtin::ALL.iter().map(|b| b.name()).collect();
                tools.extend(self.handlers.names());
                tools.sort_unstable();
                tools.dedup();
                Ok(json!({ "tools": tools }))
            }
            Builtin::ExecuteRecipe => self.run_recipe(command),
            Builtin::TransactionBegin => {
                let group = self
                    .transactions
                    .begin(&mut self.host, command.arg("name").unwrap_or_default());
                Ok(json!({
                    "message": format!("Transaction '{}' started", group.name),
                    "id": group.group_id,
                }))
            }
            Builtin::TransactionCommit => Ok(match self.transactions.commit(&mut self.host) {
                Some(group) => json!({ "message": "Transaction committed", "id": group.group_id }),
                None => json!({ "message": "No open transaction" }),
            }),
            Builtin::TransactionAbort => Ok(match self.transactions.abort(&mut self.host) {
                Some(group) => json!({ "message": "Transaction aborted", "id": group.group_id }),
                None => json!({ "message": "No open transaction" }),
            }),
            Builtin::RegistryAdd => self.registry_add(command),
            Builtin::RegistryList => Ok(json!({ "entries": self.registry.entries() })),
            Builtin::RegistryGroup => {
                let group = required(command, "group")?;
                Ok(json!({ "group": group, "entries": self.registry.by_group(group) }))
            }
            Builtin::RegistryResolve => {
                let reference = command
                    .arg("ref")
                    .or_else(|| command.arg("path"))
                    .ok_or_else(|| failure(command, HandlerError::MissingArgument("ref".into())))?;
                let resolution = self
                    .registry
                    .resolve(&self.host, reference)
                    .map_err(|err| KernelError::TargetNotFound(err.to_string()))?;
                Ok(json!({ "handle": resolution.handle, "via": resolution.via }))
            }
            Builtin::RegistrySanitize => {
                let removed = self.registry.sanitize(&self.host)?;
                Ok(json!({
                    "message": format!("Removed {} entries", removed.len()),
                    "removed": removed,
                }))
            }
            Builtin::RegistrySave => {
                self.registry.save()?;
                Ok(json!({ "message": "Registry saved", "entries": self.registry.len() }))
            }
            Builtin::RegistryLoad => {
                self.registry.reload()?;
                Ok(json!({ "message": "Registry loaded", "entries": self.registry.len() }))
            }
            Builtin::GuardStatus => Ok(match self.host.stability() {
                Ok(stability) => json!({
                    "safe": stability.is_stable(),
                    "isCompiling": stability.compiling,
                    "isChangingPlayMode": stability.changing_play_mode,
                    "isImporting": stability.importing,
                }),
                Err(err) => json!({ "safe": false, "error": err.to_string() }),
            }),
            Builtin::AuditVerify => {
                let ledger = self
                    .ledger
                    .as_ref()
                    .ok_or_else(|| KernelError::NotRunning(self.state.to_string()))?;
                Ok(match ledger.verify()? {
                    Ok(entries) => json!({ "valid": true, "entries": entries }),
                    Err(chain_break) => json!({
                        "valid": false,
                        "brokenAt": chain_break.index,
                        "reason": chain_break.kind,
                    }),
                })
            }
            Builtin::HealthCheck => Ok(serde_json::to_value(self.health()).unwrap_or(Value::Null)),
            Builtin::TelemetryErrors => {
                let errors: Vec<_> = self.telemetry.recent().collect();
                Ok(json!({ "total": self.telemetry.total(), "errors": errors }))
            }
        }
    }

    fn registry_add(&mut self, command: &Command) -> Result<Value, KernelError> {
        let reference = required(command, "path")?;
        let handle = self.resolve_target(reference)?;
        let role = required(command, "role")?.to_string();
        let id = command
            .arg("uuid")
            .map(|raw| Uuid::parse_str(raw.trim()))
            .transpose()
            .map_err(|err| failure(command, format!("invalid argument 'uuid': {err}")))?;
        let slot_index = command
            .arg("slot")
            .map(|raw| raw.trim().parse::<i32>())
            .transpose()
            .map_err(|err| failure(command, format!("invalid argument 'slot': {err}")))?;
        let registration = Registration {
            role,
            id,
            group: command.arg("group").map(str::to_string),
            slot_index,
        };
        let entry = self
            .registry
            .register(&self.host, handle, registration)
            .map_err(|err| match err {
                RegistryError::EmptyRole | RegistryError::NoFingerprint(_) => failure(command, err),
                other => KernelError::Registry(other),
            })?;
        Ok(json!({
            "message": format!("Registered {handle} as '{}'", entry.role),
            "id": entry.id,
            "entry": entry,
        }))
    }

    /// Runs every sub-command inside one transaction. The first failure
    /// reverts everything and is reported as a single `RecipeAborted`.
    fn run_recipe(&mut self, command: &Command) -> Result<Value, KernelError> {
        let data = command
            .arg("data")
            .ok_or_else(|| KernelError::MalformedCommand("recipe requires 'data'".into()))?;
        let recipe = Recipe::from_json(data)?;
        let name = command.arg("name").unwrap_or(DEFAULT_RECIPE_NAME);

        let group_id = self.transactions.begin(&mut self.host, name).group_id;
        let mut results = Vec::with_capacity(recipe.tools.len());
        for (idx, wire) in recipe.tools.into_iter().enumerate() {
            let step = idx + 1;
            let action = wire.action.clone();
            let outcome = Command::from_wire(wire).and_then(|sub| {
                match Builtin::lookup(sub.action()) {
                    Some(builtin) if !builtin.allowed_in_recipe() => Err(
                        KernelError::MalformedCommand(format!("'{}' cannot run inside a recipe", sub.action())),
                    ),
                    _ => self.execute_inner(&sub),
                }
            });
            match outcome {
                Ok(value) => results.push(value),
                Err(err) => {
                    self.transactions.abort(&mut self.host);
                    log::warn!("recipe '{name}' aborted at step {step} ({action}): {err}");
                    return Err(KernelError::RecipeAborted {
                        step,
                        action,
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.transactions.commit(&mut self.host);
        Ok(json!({
            "message": format!("Recipe '{name}' completed ({} steps)", results.len()),
            "id": group_id,
            "results": results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimScene, demo_handlers};

    fn running() -> Kernel<SimScene> {
        let mut kernel = Kernel::builder(SimScene::demo())
            .handlers(demo_handlers())
            .build();
        kernel.start().unwrap();
        kernel
    }

    #[test]
    fn builtin_lookup_normalizes() {
        assert_eq!(Builtin::lookup("System_List_Tools"), Some(Builtin::ListTools));
        assert_eq!(Builtin::lookup("transaction/Begin"), Some(Builtin::TransactionBegin));
        assert_eq!(Builtin::lookup("light/set-intensity"), None);
    }

    #[test]
    fn every_builtin_resolves_by_name_and_spelling_variants() {
        for builtin in Builtin::ALL {
            let name = builtin.name();
            assert_eq!(Builtin::lookup(name), Some(builtin), "{name}");
            let shouted = name.to_uppercase().replace('/', ".").replace('-', "_");
            assert_eq!(Builtin::lookup(&shouted), Some(builtin), "{shouted}");
            assert_eq!(Builtin::lookup(&format!("/{name}/")), Some(builtin), "{name}");
        }
    }

    #[test]
    fn list_tools_merges_builtins_and_handlers() {
        let mut kernel = running();
        let value = kernel.execute(&Command::new("system/list-tools")).unwrap();
        let tools: Vec<&str> = value["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(tools.contains(&"status"));
        assert!(tools.contains(&"light/set-intensity"));
        let mut sorted = tools.clone();
        sorted.sort_unstable();
        assert_eq!(tools, sorted);
    }

    #[test]
    fn registry_add_then_resolve() {
        let mut kernel = running();
        let added = kernel
            .execute(
                &Command::new("registry/add")
                    .with_capability("write")
                    .with_arg("path", "Avatar/Body")
                    .with_arg("role", "torso")
                    .with_arg("group", "outfit"),
            )
            .unwrap();
        assert!(added["id"].is_string());
        let resolved = kernel
            .execute(&Command::new("registry/resolve").with_arg("ref", "sem:torso"))
            .unwrap();
        assert_eq!(resolved["via"], "cached_handle");
        let group = kernel
            .execute(&Command::new("registry/group").with_arg("group", "outfit"))
            .unwrap();
        assert_eq!(group["entries"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn registry_add_rejects_bad_uuid() {
        let mut kernel = running();
        let err = kernel
            .execute(
                &Command::new("registry/add")
                    .with_capability("write")
                    .with_arg("path", "Avatar/Body")
                    .with_arg("role", "torso")
                    .with_arg("uuid", "not-a-uuid"),
            )
            .unwrap_err();
        assert_eq!(err.code(), "HANDLER_FAILURE");
        assert!(kernel.registry().is_empty());
    }

    #[test]
    fn transaction_builtins_round_trip() {
        let mut kernel = running();
        let begun = kernel
            .execute(&Command::new("transaction/begin").with_arg("name", "Tweak"))
            .unwrap();
        assert_eq!(begun["id"], 1);
        kernel
            .execute(
                &Command::new("object/set-value")
                    .with_arg("path", "Key Light")
                    .with_arg("key", "color")
                    .with_arg("value", "red"),
            )
            .unwrap();
        let aborted = kernel.execute(&Command::new("transaction/abort")).unwrap();
        assert_eq!(aborted["message"], "Transaction aborted");
        let light = kernel.host().find_by_path("Key Light").unwrap();
        assert!(!kernel.host().object(light).unwrap().properties.contains_key("color"));
        let again = kernel.execute(&Command::new("transaction/commit")).unwrap();
        assert_eq!(again["message"], "No open transaction");
    }

    #[test]
    fn recipe_rejects_nested_transactions() {
        let mut kernel = running();
        let data = r#"{"tools":[{"action":"transaction/begin","keys":[],"values":[]}]}"#;
        let err = kernel
            .execute(
                &Command::new("system/execute-recipe")
                    .with_capability("write")
                    .with_arg("data", data),
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::RecipeAborted { step: 1, .. }));
    }

    #[test]
    fn guard_and_audit_builtins() {
        let mut kernel = running();
        let guard = kernel.execute(&Command::new("guard/status")).unwrap();
        assert_eq!(guard["safe"], true);
        kernel
            .execute(
                &Command::new("object/rename")
                    .with_capability("write")
                    .with_arg("path", "Hair")
                    .with_arg("name", "Bangs"),
            )
            .unwrap();
        let audit = kernel.execute(&Command::new("audit/verify")).unwrap();
        assert_eq!(audit["valid"], true);
        assert_eq!(audit["entries"], 1);
    }

    #[test]
    fn telemetry_lists_recent_errors() {
        let mut kernel = running();
        let _ = kernel.execute(&Command::new("nope"));
        let value = kernel.execute(&Command::new("telemetry/get-errors")).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["errors"][0]["code"], "TOOL_NOT_FOUND");
    }
}
