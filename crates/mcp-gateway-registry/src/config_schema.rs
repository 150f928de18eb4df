//! Emits the gateway config's JSON Schema for editor tooling, mirroring
//! the teacher's companion schema-generation binary.

fn main() {
    let schema = schemars::schema_for!(gateway_core::config::GatewayConfig);
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).expect("schema serializes")
    );
}
