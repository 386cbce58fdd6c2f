use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::action::{Action, ActionDescriptor, ActionError, ActionInvocation};
use crate::protocol::ToolDefinition;

/// The actions available to the model for one request.
///
/// Registration order is kept so the model always sees the same tool list.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: Vec<Arc<dyn Action>>,
    by_name: HashMap<String, usize>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Action + 'static>(&mut self, action: A) -> Result<(), ActionError> {
        self.register_shared(Arc::new(action))
    }

    pub fn register_shared(&mut self, action: Arc<dyn Action>) -> Result<(), ActionError> {
        let name = action.descriptor().name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(ActionError::Duplicate(name));
        }
        self.by_name.insert(name, self.actions.len());
        self.actions.push(action);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.by_name.get(name).map(|&i| &self.actions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.iter().map(|a| a.descriptor())
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors()
            .map(|d| ToolDefinition {
                name: d.name().to_string(),
                description: d.description().to_string(),
                parameters: d.json_schema(),
            })
            .collect()
    }

    /// Validates the call against the action's descriptor, then runs it.
    /// The implementation never sees arguments that failed validation.
    pub async fn invoke(&self, invocation: &ActionInvocation) -> Result<String, ActionError> {
        let action = self
            .get(&invocation.name)
            .ok_or_else(|| ActionError::Unknown(invocation.name.clone()))?;

        let arguments = action.descriptor().validate(invocation)?;

        info!("Invoking action '{}' ({})", invocation.name, invocation.id);
        let result = action.invoke(arguments).await?;
        info!(
            "Action '{}' finished. Output size: {} bytes",
            invocation.name,
            result.len()
        );
        Ok(result)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors().map(|d| d.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::action::{ActionArguments, ActionParameter, ParameterType};

    struct Echo {
        descriptor: ActionDescriptor,
        calls: Arc<AtomicUsize>,
    }

    impl Echo {
        fn named(name: &str, calls: Arc<AtomicUsize>) -> Self {
            let descriptor = ActionDescriptor::builder(name, "Echoes its input.")
                .parameter(ActionParameter::required("input", ParameterType::String, ""))
                .build()
                .unwrap();
            Self { descriptor, calls }
        }
    }

    #[async_trait]
    impl Action for Echo {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, arguments: ActionArguments) -> Result<String, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(arguments.require_str("input")?.to_uppercase())
        }
    }

    fn registry_with(names: &[&str], calls: &Arc<AtomicUsize>) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        for name in names {
            registry.register(Echo::named(name, calls.clone())).unwrap();
        }
        registry
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = registry_with(&["echo"], &calls);
        let err = registry.register(Echo::named("echo", calls)).unwrap_err();
        assert!(matches!(err, ActionError::Duplicate(ref name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn tools_keep_registration_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(&["b", "a", "c"], &calls);
        let names: Vec<String> = registry.tool_definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["b", "a", "c"]);
        assert_eq!(registry.tool_definitions()[0].parameters["required"][0], "input");
    }

    #[tokio::test]
    async fn invoke_runs_the_bound_implementation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(&["echo"], &calls);
        let out = registry
            .invoke(&ActionInvocation::new("1", "echo", r#"{"input":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(out, "HI");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_calls_never_reach_the_implementation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(&["echo"], &calls);

        let err = registry
            .invoke(&ActionInvocation::new("1", "echo", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::MissingArgument { .. }));

        let err = registry
            .invoke(&ActionInvocation::new("2", "shout", r#"{"input":"hi"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Unknown(_)));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
