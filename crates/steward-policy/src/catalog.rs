//! Built-in action catalog.
//!
//! Used when the configuration does not provide its own `actions`. Every
//! entry only describes the operation; executing it is up to the backend.

use serde_json::{Value, json};
use steward_core::{ActionSpec, CompensationRef, Reversibility, RiskClass};

fn action(
    name: &str,
    category: &str,
    reversibility: Reversibility,
    risk: RiskClass,
    description: &str,
    params_schema: Value,
) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        description: Some(description.to_string()),
        category: category.to_string(),
        reversibility,
        risk,
        params_schema,
        compensation: None,
        timeout_ms: None,
        max_attempts: None,
    }
}

fn compensated_by(mut spec: ActionSpec, action: &str, params: Option<Value>) -> ActionSpec {
    spec.compensation = Some(CompensationRef {
        action: action.to_string(),
        params,
    });
    spec
}

fn service_schema(extra: Value) -> Value {
    let mut properties = json!({ "service": { "type": "string", "minLength": 1 } });
    if let (Some(props), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        props.extend(extra);
    }
    json!({
        "type": "object",
        "required": ["service"],
        "properties": properties
    })
}

fn provision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "provider": { "enum": ["aws", "gcp", "azure", "local"] },
            "region": { "type": "string" },
            "spec": { "type": "object" }
        }
    })
}

/// The standard catalog.
pub fn standard_actions() -> Vec<ActionSpec> {
    use Reversibility::*;
    use RiskClass::*;

    let replicas = json!({ "replicas": { "type": "integer", "minimum": 1 } });

    vec![
        // Service operations
        compensated_by(
            action(
                "scale_up",
                "scaling",
                Reversible,
                Low,
                "Increase the replica count of a service",
                service_schema(replicas.clone()),
            ),
            "scale_down",
            None,
        ),
        compensated_by(
            action(
                "scale_down",
                "scaling",
                Reversible,
                Low,
                "Decrease the replica count of a service",
                service_schema(replicas),
            ),
            "scale_up",
            None,
        ),
        action(
            "restart_service",
            "service",
            Reversible,
            Low,
            "Restart a service",
            service_schema(json!({})),
        ),
        action(
            "heal_service",
            "service",
            Reversible,
            Low,
            "Recreate unhealthy instances of a service",
            service_schema(json!({})),
        ),
        action(
            "optimize_performance",
            "service",
            Reversible,
            Medium,
            "Apply a performance tuning operation",
            service_schema(json!({
                "operation": { "enum": ["increase_cache_size", "cleanup_logs", "identify_unused"] }
            })),
        ),
        // Delivery
        compensated_by(
            action(
                "deploy_update",
                "deploy",
                Compensable,
                Medium,
                "Roll out a new version of a service",
                {
                    let mut s = service_schema(json!({ "version": { "type": "string" } }));
                    s["required"] = json!(["service", "version"]);
                    s
                },
            ),
            "rollback",
            Some(json!({ "version": "previous" })),
        ),
        action(
            "rollback",
            "deploy",
            Reversible,
            Medium,
            "Return a service to an earlier version",
            service_schema(json!({ "version": { "type": "string" } })),
        ),
        compensated_by(
            action(
                "update_config",
                "config",
                Compensable,
                Medium,
                "Change runtime configuration of a service",
                service_schema(json!({ "settings": { "type": "object" } })),
            ),
            "rollback",
            Some(json!({ "version": "previous" })),
        ),
        compensated_by(
            action(
                "update_security",
                "security",
                Compensable,
                Medium,
                "Apply security patches or policy updates",
                service_schema(json!({ "patches": { "type": "array", "items": { "type": "string" } } })),
            ),
            "rollback",
            Some(json!({ "version": "previous" })),
        ),
        action(
            "create_alert",
            "monitoring",
            Reversible,
            Low,
            "Register an alert rule",
            json!({
                "type": "object",
                "required": ["rule"],
                "properties": { "rule": { "type": "string" }, "severity": { "type": "string" } }
            }),
        ),
        // Infrastructure
        compensated_by(
            action(
                "provision_network",
                "network",
                Compensable,
                Low,
                "Create networking (VPC, subnets, gateways)",
                provision_schema(),
            ),
            "deprovision",
            None,
        ),
        compensated_by(
            action(
                "provision_compute",
                "compute",
                Compensable,
                Low,
                "Create compute capacity (instances, clusters)",
                provision_schema(),
            ),
            "deprovision",
            None,
        ),
        compensated_by(
            action(
                "provision_database",
                "database",
                Compensable,
                Medium,
                "Create a managed database",
                provision_schema(),
            ),
            "deprovision",
            None,
        ),
        compensated_by(
            action(
                "provision_security",
                "security",
                Compensable,
                Low,
                "Create security groups and IAM bindings",
                provision_schema(),
            ),
            "deprovision",
            None,
        ),
        compensated_by(
            action(
                "provision_monitoring",
                "monitoring",
                Compensable,
                Low,
                "Create dashboards and metric collection",
                provision_schema(),
            ),
            "deprovision",
            None,
        ),
        action(
            "deprovision",
            "infrastructure",
            Reversible,
            Medium,
            "Remove a resource created by a provision action",
            json!({ "type": "object" }),
        ),
        action(
            "destroy_infrastructure",
            "infrastructure",
            Irreversible,
            High,
            "Destroy a resource and its data",
            json!({
                "type": "object",
                "required": ["confirm"],
                "properties": { "confirm": { "const": true } }
            }),
        ),
    ]
}
