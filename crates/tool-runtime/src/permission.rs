use crate::middleware::{FunctionMiddleware, InvocationContext, MiddlewareScope, Next};
use crate::tool::{ToolDefinition, ToolError};
use async_trait::async_trait;
use gantry_core::coordinator::CoordinatorError;
use gantry_core::event::{EventKind, PermissionRequest, PermissionResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a matching tool invocation may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Run without prompting.
    AutoApprove,
    /// Ask the caller before running.
    RequireConfirmation,
    /// Never run.
    Deny,
}

/// Scope-rule permission table for tool invocations.
///
/// Rules reuse the middleware scope model: a rule can target everything,
/// a plugin, a skill, or a single function, matched against the tool's
/// definition and origin. The most specific matching rule decides; on
/// equal specificity the rule added last wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    rules: Vec<(MiddlewareScope, PermissionLevel)>,
    default_level: PermissionLevel,
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_level: PermissionLevel::RequireConfirmation,
        }
    }

    /// Level applied when no rule matches.
    pub fn with_default(mut self, level: PermissionLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn allow(self, scope: MiddlewareScope) -> Self {
        self.rule(scope, PermissionLevel::AutoApprove)
    }

    pub fn confirm(self, scope: MiddlewareScope) -> Self {
        self.rule(scope, PermissionLevel::RequireConfirmation)
    }

    pub fn deny(self, scope: MiddlewareScope) -> Self {
        self.rule(scope, PermissionLevel::Deny)
    }

    pub fn rule(mut self, scope: MiddlewareScope, level: PermissionLevel) -> Self {
        self.rules.push((scope, level));
        self
    }

    /// Resolve the level for one tool.
    pub fn level_for(&self, definition: &ToolDefinition) -> PermissionLevel {
        let mut winner: Option<(u8, PermissionLevel)> = None;
        for (scope, level) in &self.rules {
            if !scope.applies_to(definition) {
                continue;
            }
            let specificity = scope.rank();
            match winner {
                Some((best, _)) if best > specificity => {}
                _ => winner = Some((specificity, *level)),
            }
        }
        winner
            .map(|(_, level)| level)
            .unwrap_or(self.default_level)
    }
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Proceed without prompting.
    Allow,
    /// Emit a `permission_request` and wait for the caller's reply.
    Prompt,
    /// Refuse with a reason; the tool never runs.
    Refuse(String),
}

/// Decides whether a tool invocation may proceed. The table-driven
/// [`PolicyChecker`] covers the common case; embedders can bring their own
/// source (remote policy service, per-session grants).
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, definition: &ToolDefinition, arguments: &Value) -> PermissionDecision;
}

/// Checker backed by a [`PermissionPolicy`] table.
pub struct PolicyChecker {
    policy: PermissionPolicy,
}

impl PolicyChecker {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl PermissionChecker for PolicyChecker {
    async fn check(&self, definition: &ToolDefinition, _arguments: &Value) -> PermissionDecision {
        match self.policy.level_for(definition) {
            PermissionLevel::AutoApprove => PermissionDecision::Allow,
            PermissionLevel::RequireConfirmation => PermissionDecision::Prompt,
            PermissionLevel::Deny => PermissionDecision::Refuse(format!(
                "tool '{}' is blocked by policy",
                definition.name
            )),
        }
    }
}

/// Function middleware gating tool invocations on permissions.
///
/// `Prompt` turns into an interactive flow: the middleware emits a
/// `permission_request` event and awaits the matching typed response
/// before deciding whether to call `next`. Refusals, denials and timeouts
/// short-circuit with a "permission denied" result; the tool never runs.
pub struct PermissionMiddleware {
    checker: Arc<dyn PermissionChecker>,
    timeout: Duration,
}

impl PermissionMiddleware {
    pub fn new(checker: Arc<dyn PermissionChecker>, timeout: Duration) -> Self {
        Self { checker, timeout }
    }
}

#[async_trait]
impl FunctionMiddleware for PermissionMiddleware {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn invoke(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Result<(), ToolError> {
        let decision = self
            .checker
            .check(&ctx.definition, &ctx.call.arguments)
            .await;

        match decision {
            PermissionDecision::Allow => next.run(ctx).await,
            PermissionDecision::Refuse(reason) => {
                debug!(tool = %ctx.call.name, %reason, "invocation refused by policy");
                ctx.terminate_with(format!("Permission denied: {}", reason), true);
                Ok(())
            }
            PermissionDecision::Prompt => {
                let request_id = Uuid::new_v4().to_string();
                // Register before emitting so the reply cannot race the wait.
                let waiter = ctx.register_waiter(&request_id);
                ctx.emit(EventKind::PermissionRequest(PermissionRequest {
                    request_id: request_id.clone(),
                    call_id: ctx.call.call_id.clone(),
                    tool_name: ctx.call.name.clone(),
                    arguments: ctx.call.arguments.clone(),
                }));

                match ctx.wait::<PermissionResponse>(waiter, self.timeout).await {
                    Ok(response) if response.approved => next.run(ctx).await,
                    Ok(response) => {
                        let reason = response
                            .reason
                            .unwrap_or_else(|| "denied by caller".to_string());
                        debug!(tool = %ctx.call.name, %reason, "permission denied interactively");
                        ctx.terminate_with(format!("Permission denied: {}", reason), true);
                        Ok(())
                    }
                    Err(CoordinatorError::Timeout { .. }) => {
                        warn!(tool = %ctx.call.name, "permission request timed out");
                        ctx.terminate_with(
                            "Permission denied: request timed out".to_string(),
                            true,
                        );
                        Ok(())
                    }
                    Err(CoordinatorError::Cancelled { .. }) => Err(ToolError::Cancelled),
                    Err(err) => Err(ToolError::Middleware {
                        middleware: "permission".to_string(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::FunctionPipeline;
    use crate::registry::ToolRegistry;
    use crate::scheduler::ToolScheduler;
    use crate::tool::{LabelTool, ToolOrigin};
    use gantry_core::coordinator::TurnCoordinator;
    use gantry_core::message::ToolCall;
    use gantry_core::options::AgentOptions;
    use tokio_util::sync::CancellationToken;

    fn tool_in_plugin(name: &str, plugin: Option<&str>) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object"}),
            origin: ToolOrigin {
                plugin: plugin.map(String::from),
                skill: None,
            },
        }
    }

    #[test]
    fn unmatched_tools_fall_back_to_the_default_level() {
        let policy = PermissionPolicy::new();
        assert_eq!(
            policy.level_for(&tool_in_plugin("anything", None)),
            PermissionLevel::RequireConfirmation
        );

        let permissive = PermissionPolicy::new().with_default(PermissionLevel::AutoApprove);
        assert_eq!(
            permissive.level_for(&tool_in_plugin("anything", None)),
            PermissionLevel::AutoApprove
        );
    }

    #[test]
    fn more_specific_scope_wins() {
        // A whole plugin is trusted except for one destructive function.
        let policy = PermissionPolicy::new()
            .allow(MiddlewareScope::Plugin("files".to_string()))
            .deny(MiddlewareScope::Function("file_delete".to_string()));

        assert_eq!(
            policy.level_for(&tool_in_plugin("file_read", Some("files"))),
            PermissionLevel::AutoApprove
        );
        assert_eq!(
            policy.level_for(&tool_in_plugin("file_delete", Some("files"))),
            PermissionLevel::Deny
        );
        assert_eq!(
            policy.level_for(&tool_in_plugin("shell", None)),
            PermissionLevel::RequireConfirmation
        );
    }

    #[test]
    fn last_rule_wins_on_equal_specificity() {
        let policy = PermissionPolicy::new()
            .deny(MiddlewareScope::Function("label".to_string()))
            .allow(MiddlewareScope::Function("label".to_string()));
        assert_eq!(
            policy.level_for(&tool_in_plugin("label", None)),
            PermissionLevel::AutoApprove
        );
    }

    #[test]
    fn global_rule_overrides_the_default_but_not_scoped_rules() {
        let policy = PermissionPolicy::new()
            .allow(MiddlewareScope::Global)
            .confirm(MiddlewareScope::Skill("deploy".to_string()));

        assert_eq!(
            policy.level_for(&tool_in_plugin("anything", None)),
            PermissionLevel::AutoApprove
        );
        let deploy_tool = ToolDefinition {
            origin: ToolOrigin {
                plugin: None,
                skill: Some("deploy".to_string()),
            },
            ..tool_in_plugin("rollout", None)
        };
        assert_eq!(
            policy.level_for(&deploy_tool),
            PermissionLevel::RequireConfirmation
        );
    }

    #[tokio::test]
    async fn checker_maps_levels_to_decisions() {
        let policy = PermissionPolicy::new()
            .allow(MiddlewareScope::Function("label".to_string()))
            .deny(MiddlewareScope::Function("shell".to_string()));
        let checker = PolicyChecker::new(policy);
        let arguments = serde_json::json!({});

        assert_eq!(
            checker
                .check(&tool_in_plugin("label", None), &arguments)
                .await,
            PermissionDecision::Allow
        );
        assert_eq!(
            checker
                .check(&tool_in_plugin("unlisted", None), &arguments)
                .await,
            PermissionDecision::Prompt
        );
        assert!(matches!(
            checker
                .check(&tool_in_plugin("shell", None), &arguments)
                .await,
            PermissionDecision::Refuse(reason) if reason.contains("shell")
        ));
    }

    fn confirm_everything_scheduler() -> ToolScheduler {
        let mut registry = ToolRegistry::new();
        registry.register(LabelTool).unwrap();
        let mut pipeline = FunctionPipeline::new();
        pipeline.register(Arc::new(PermissionMiddleware::new(
            Arc::new(PolicyChecker::new(PermissionPolicy::new())),
            Duration::from_secs(5),
        )));
        ToolScheduler::new(Arc::new(registry), Arc::new(pipeline))
    }

    fn label_call() -> ToolCall {
        ToolCall {
            call_id: "call_p".to_string(),
            name: "label".to_string(),
            arguments: serde_json::json!({"snippet": "secret"}),
        }
    }

    #[tokio::test]
    async fn denied_response_short_circuits_without_invoking_tool() {
        let scheduler = confirm_everything_scheduler();
        let (coordinator, mut drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let exec = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(
                        &[label_call()],
                        &coordinator,
                        &AgentOptions::default(),
                        &cancel,
                    )
                    .await
            })
        };

        // Harness side: watch for the request, reply denied.
        let request_id = loop {
            if let Some(event) = drainer.recv().await {
                if let EventKind::PermissionRequest(req) = &event.kind {
                    break req.request_id.clone();
                }
            }
        };
        coordinator.send_response(
            &request_id,
            EventKind::PermissionResponse(PermissionResponse {
                request_id: request_id.clone(),
                approved: false,
                reason: None,
            }),
        );

        let outcome = exec.await.unwrap().unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].is_error);
        assert!(outcome.results[0].content.starts_with("Permission denied"));
    }

    #[tokio::test]
    async fn approved_response_lets_the_tool_run() {
        let scheduler = confirm_everything_scheduler();
        let (coordinator, mut drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let exec = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(
                        &[label_call()],
                        &coordinator,
                        &AgentOptions::default(),
                        &cancel,
                    )
                    .await
            })
        };

        let request_id = loop {
            if let Some(event) = drainer.recv().await {
                if let EventKind::PermissionRequest(req) = &event.kind {
                    break req.request_id.clone();
                }
            }
        };
        coordinator.send_response(
            &request_id,
            EventKind::PermissionResponse(PermissionResponse {
                request_id: request_id.clone(),
                approved: true,
                reason: None,
            }),
        );

        let outcome = exec.await.unwrap().unwrap();
        assert_eq!(outcome.results[0].content, "[note] secret");
        assert!(!outcome.results[0].is_error);
    }

    #[tokio::test]
    async fn timeout_is_recovered_as_denial() {
        let mut registry = ToolRegistry::new();
        registry.register(LabelTool).unwrap();
        let mut pipeline = FunctionPipeline::new();
        pipeline.register(Arc::new(PermissionMiddleware::new(
            Arc::new(PolicyChecker::new(PermissionPolicy::new())),
            Duration::from_millis(20),
        )));
        let scheduler = ToolScheduler::new(Arc::new(registry), Arc::new(pipeline));
        let (coordinator, _drainer) = TurnCoordinator::new();

        let outcome = scheduler
            .execute(
                &[label_call()],
                &coordinator,
                &AgentOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.results[0].is_error);
        assert!(outcome.results[0].content.contains("timed out"));
    }
}
