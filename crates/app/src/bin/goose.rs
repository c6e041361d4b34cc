use goose::prelude::*;
use rand::Rng;
use serde_json::json;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().cookie_store(true).gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn execute_payload(id: u64, a: i64, b: i64) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "execute",
        "params": {
            "code": format!("obj = host.add_object('cube', location=({a}, {b}, 0))\nresult = {a} + {b}"),
        },
    })
}

async fn execute_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let (id, a, b) = {
        let mut rng = rand::rng();
        (
            rng.random_range(1..u64::MAX / 2),
            rng.random_range(-1000i64..1000),
            rng.random_range(-1000i64..1000),
        )
    };
    let payload = execute_payload(id, a, b);
    let mut goose = user.post_json("/", &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    if parsed.get("id").and_then(|value| value.as_u64()) != Some(id) {
        return user.set_failure("id mismatch", &mut goose.request, None, Some(&body));
    }
    if parsed.get("result").and_then(|value| value.as_i64()) != Some(a + b) {
        return user.set_failure("wrong result", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

async fn describe_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let payload = json!({"jsonrpc": "2.0", "id": "describe", "method": "describe"});
    let _goose = user.post_json("/", &payload).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("execute_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(execute_roundtrip).set_weight(9)?)
                .register_transaction(transaction!(describe_roundtrip)),
        )
        .execute()
        .await?;
    Ok(())
}
