//! # Flow Registry
//!
//! Immutable `flow_type -> handler` table assembled once at startup and
//! shared by reference with everything that starts or resumes flows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use super::{FlowHandler, Interrogate, ListProcesses, Netstat};
use crate::error::{HuntsmanError, Result};
use crate::models::START_STATE;

#[derive(Default)]
pub struct FlowRegistryBuilder {
    handlers: Vec<Arc<dyn FlowHandler>>,
}

impl FlowRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: FlowHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, handler: Arc<dyn FlowHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_builtin_flows(self) -> Self {
        self.register(Netstat)
            .register(ListProcesses)
            .register(Interrogate)
    }

    /// Validate the state tables and freeze the registry
    pub fn build(self) -> Result<FlowRegistry> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for handler in self.handlers {
            let flow_type = handler.flow_type();
            if flow_type.trim().is_empty() {
                return Err(HuntsmanError::ConfigurationError(
                    "flow type must not be empty".to_string(),
                ));
            }
            validate_states(flow_type, &handler.state_names())?;
            if handlers.insert(flow_type, handler).is_some() {
                return Err(HuntsmanError::ConfigurationError(format!(
                    "flow type {flow_type} registered twice"
                )));
            }
        }
        info!(flow_types = handlers.len(), "Flow registry built");
        Ok(FlowRegistry { handlers })
    }
}

fn validate_states(flow_type: &str, states: &[&str]) -> Result<()> {
    if states.is_empty() {
        return Err(HuntsmanError::ConfigurationError(format!(
            "flow {flow_type} declares no states"
        )));
    }
    let mut seen = HashSet::new();
    for state in states {
        if state.trim().is_empty() || *state == START_STATE {
            return Err(HuntsmanError::ConfigurationError(format!(
                "flow {flow_type} declares invalid state {state:?}"
            )));
        }
        if !seen.insert(*state) {
            return Err(HuntsmanError::ConfigurationError(format!(
                "flow {flow_type} declares state {state} twice"
            )));
        }
    }
    Ok(())
}

pub struct FlowRegistry {
    handlers: HashMap<&'static str, Arc<dyn FlowHandler>>,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder::new()
    }

    /// Registry holding the flows shipped with the crate
    pub fn with_builtin_flows() -> Result<Self> {
        Self::builder().with_builtin_flows().build()
    }

    pub fn get(&self, flow_type: &str) -> Result<Arc<dyn FlowHandler>> {
        self.handlers
            .get(flow_type)
            .cloned()
            .ok_or_else(|| HuntsmanError::UnknownFlowType(flow_type.to_string()))
    }

    pub fn contains(&self, flow_type: &str) -> bool {
        self.handlers.contains_key(flow_type)
    }

    pub fn flow_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_types", &self.flow_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{FlowContext, HandlerResult};
    use crate::orchestration::correlator::Responses;
    use serde_json::Value;

    struct Raw(&'static str, Vec<&'static str>);

    impl FlowHandler for Raw {
        fn flow_type(&self) -> &'static str {
            self.0
        }
        fn state_names(&self) -> Vec<&'static str> {
            self.1.clone()
        }
        fn validate_args(&self, _: &Value) -> HandlerResult {
            Ok(())
        }
        fn start(&self, _: &mut FlowContext) -> HandlerResult {
            Ok(())
        }
        fn handle_responses(&self, _: &str, _: &mut FlowContext, _: Responses) -> HandlerResult {
            Ok(())
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = FlowRegistry::with_builtin_flows().unwrap();
        assert_eq!(
            registry.flow_types(),
            vec!["Interrogate", "ListProcesses", "Netstat"]
        );
        assert!(matches!(
            registry.get("Nope"),
            Err(HuntsmanError::UnknownFlowType(_))
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_bad_state_tables() {
        assert!(FlowRegistry::builder()
            .register(Netstat)
            .register(Netstat)
            .build()
            .is_err());
        assert!(FlowRegistry::builder()
            .register(Raw("Empty", vec![]))
            .build()
            .is_err());
        assert!(FlowRegistry::builder()
            .register(Raw("Dup", vec!["A", "A"]))
            .build()
            .is_err());
        assert!(FlowRegistry::builder()
            .register(Raw("Reserved", vec!["Start"]))
            .build()
            .is_err());
        assert!(FlowRegistry::builder()
            .register(Raw("Ok", vec!["A", "B"]))
            .build()
            .is_ok());
    }
}
