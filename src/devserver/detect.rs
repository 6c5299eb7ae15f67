use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::storage::ServerType;

/// A dev-server candidate discovered in a project, offered as a UI
/// suggestion. Read-only heuristics; nothing here touches processes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectedServer {
    pub name: String,
    pub command: String,
    pub server_type: ServerType,
}

/// Script names that usually start a long-running server.
const SERVER_SCRIPTS: &[&str] = &["dev", "start", "serve", "preview", "watch"];

/// Scan `package.json` scripts for server-shaped entries.
pub fn detect_npm_scripts(dir: &Path) -> Vec<DetectedServer> {
    let path = dir.join("package.json");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let Ok(json) = serde_json::from_str::<Value>(&content) else {
        return Vec::new();
    };
    let Some(scripts) = json.get("scripts").and_then(Value::as_object) else {
        return Vec::new();
    };

    SERVER_SCRIPTS
        .iter()
        .filter(|name| scripts.contains_key(**name))
        .map(|name| DetectedServer {
            name: name.to_string(),
            command: format!("npm run {}", name),
            server_type: ServerType::Node,
        })
        .collect()
}

/// All dev-server suggestions for a project directory.
pub fn detect_servers(dir: &Path) -> Vec<DetectedServer> {
    let mut detected = detect_npm_scripts(dir);
    detected.extend(detect_docker_services(dir));
    detected
}

/// Scan a compose file for service names. Intentionally a line-level
/// heuristic: top-level `services:` block, one indent level below it.
pub fn detect_docker_services(dir: &Path) -> Vec<DetectedServer> {
    let content = ["docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"]
        .iter()
        .find_map(|name| std::fs::read_to_string(dir.join(name)).ok());
    let Some(content) = content else {
        return Vec::new();
    };

    let mut services = Vec::new();
    let mut in_services = false;

    for line in content.lines() {
        if line.trim_end() == "services:" {
            in_services = true;
            continue;
        }
        if in_services {
            // A new top-level key ends the services block
            if !line.starts_with(' ') && !line.trim().is_empty() {
                break;
            }
            let indent = line.len() - line.trim_start().len();
            let trimmed = line.trim();
            if indent == 2 && trimmed.ends_with(':') && !trimmed.starts_with('#') {
                let name = trimmed.trim_end_matches(':').to_string();
                services.push(DetectedServer {
                    command: format!("docker compose up -d {}", name),
                    name,
                    server_type: ServerType::Docker,
                });
            }
        }
    }

    services
}
