//! Demo handler table served by `sandbox-rpc-peer serve`.

use sandbox_rpc::{HandlerError, Handlers};
use serde_json::{json, Value};
use std::time::Duration;

pub fn demo_handlers() -> Handlers {
    Handlers::new()
        .register("double", double)
        .register("echo", echo)
        .register("fail", fail)
        .register("reject", reject)
        .register("sleep", sleep)
}

async fn double(args: Vec<Value>) -> Result<Value, HandlerError> {
    let n = args
        .first()
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::new("double expects a number"))?;

    // Keep integers integral on the wire.
    match args.first().and_then(Value::as_i64) {
        Some(i) => Ok(json!(i * 2)),
        None => Ok(json!(n * 2.0)),
    }
}

async fn echo(args: Vec<Value>) -> Result<Value, HandlerError> {
    Ok(Value::Array(args))
}

/// Structured failure, carrying the first argument as its message.
async fn fail(args: Vec<Value>) -> Result<Value, HandlerError> {
    let message = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("failure requested");
    Err(HandlerError::with_stack(
        message,
        format!("Error: {message}\n    at fail (sandbox-rpc-peer)"),
    ))
}

/// Plain-value rejection of the first argument.
async fn reject(args: Vec<Value>) -> Result<Value, HandlerError> {
    Err(HandlerError::reject(
        args.into_iter().next().unwrap_or(Value::Null),
    ))
}

async fn sleep(args: Vec<Value>) -> Result<Value, HandlerError> {
    let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_handlers() {
        let handlers = demo_handlers();
        assert_eq!(handlers.names(), vec!["double", "echo", "fail", "reject", "sleep"]);

        assert_eq!(handlers.invoke("double", vec![json!(21)]).await, Ok(json!(42)));
        assert_eq!(handlers.invoke("double", vec![json!(1.5)]).await, Ok(json!(3.0)));
        assert!(handlers.invoke("double", vec![json!("x")]).await.is_err());
        assert_eq!(
            handlers.invoke("echo", vec![json!(1), json!("two")]).await,
            Ok(json!([1, "two"]))
        );
        assert_eq!(
            handlers.invoke("reject", vec![json!("nope")]).await,
            Err(HandlerError::Value(json!("nope")))
        );
        assert_eq!(handlers.invoke("sleep", vec![json!(0)]).await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_fail_is_structured() {
        let err = demo_handlers()
            .invoke("fail", vec![json!("boom")])
            .await
            .unwrap_err();
        match err {
            HandlerError::Error { message, stack } => {
                assert_eq!(message, "boom");
                assert!(stack.unwrap().starts_with("Error: boom"));
            }
            other => panic!("Expected structured error, got: {:?}", other),
        }
    }
}
