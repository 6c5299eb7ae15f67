use std::collections::HashMap;

use crate::storage::{AppConfig, ProviderConfig};

/// Provider registry for building agent CLI invocations from configuration
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Create a registry from a provider table
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.providers.clone())
    }

    /// Get the configuration for a specific provider name
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Get all registered provider names
    pub fn list(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Multiplexer session name for a session record owned by a provider
    pub fn session_name(&self, agent_type: &str, record_id: &str) -> Result<String, RegistryError> {
        let provider = self.require(agent_type)?;
        Ok(format!("{}-{}", provider.session_prefix, record_id))
    }

    fn require(&self, name: &str) -> Result<&ProviderConfig, RegistryError> {
        self.providers
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    fn base_args(
        provider: &ProviderConfig,
        model: Option<&str>,
        auto_approve: bool,
    ) -> Vec<String> {
        let mut args = Vec::new();

        if auto_approve {
            if let Some(ref flag) = provider.auto_approve_flag {
                args.push(flag.clone());
            }
        }

        if let Some(ref model_flag) = provider.model_flag {
            let model = model.unwrap_or(&provider.default_model);
            args.push(model_flag.clone());
            args.push(model.to_string());
        }

        args
    }

    /// Build a non-interactive stream-JSON turn invocation.
    ///
    /// Adds the resume flag when a prior agent-internal session id is known,
    /// then the provider's print args, then the prompt itself.
    pub fn build_turn_command(
        &self,
        agent_type: &str,
        model: Option<&str>,
        auto_approve: bool,
        resume_id: Option<&str>,
        prompt: &str,
    ) -> Result<BuiltCommand, RegistryError> {
        let provider = self.require(agent_type)?;

        let mut args = Self::base_args(provider, model, auto_approve);

        if let (Some(flag), Some(id)) = (&provider.resume_flag, resume_id) {
            args.push(flag.clone());
            args.push(id.to_string());
        }

        args.extend(provider.print_args.clone());
        args.push(prompt.to_string());

        Ok(BuiltCommand {
            command: provider.command.clone(),
            args,
            env: provider.env.clone().unwrap_or_default(),
        })
    }

    /// Build the interactive invocation run as a multiplexer session's
    /// foreground process.
    pub fn build_interactive_command(
        &self,
        agent_type: &str,
        model: Option<&str>,
        auto_approve: bool,
    ) -> Result<BuiltCommand, RegistryError> {
        let provider = self.require(agent_type)?;
        let args = Self::base_args(provider, model, auto_approve);

        Ok(BuiltCommand {
            command: provider.command.clone(),
            args,
            env: provider.env.clone().unwrap_or_default(),
        })
    }
}

/// A built command ready for execution
#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl BuiltCommand {
    pub fn args_as_str(&self) -> Vec<&str> {
        self.args.iter().map(|s| s.as_str()).collect()
    }

    /// Render as a single shell line, single-quoting every argument.
    /// Used when the command is handed to a multiplexer as one string.
    pub fn to_shell(&self) -> String {
        let mut parts = vec![shell_quote(&self.command)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Single-quote a shell word, escaping embedded single quotes.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}
