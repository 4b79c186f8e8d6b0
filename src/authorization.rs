use crate::error::PipelineError;
use crate::sandbox::{Binding, Invocation, Sandbox};
use crate::types::{InboundRequest, WebhookConfig};
use serde_json::Value;

/// Run the webhook's `authorize(headers, body, query, params)` script.
///
/// No script means the request is let through without creating a sandbox.
/// Only a literal `true` authorizes; `false` is a 401 and anything else
/// (other types, throws, timeouts, limit breaches) is a script error.
pub async fn authorize(
    sandbox: &Sandbox,
    webhook: &WebhookConfig,
    request: &InboundRequest,
) -> Result<(), PipelineError> {
    let Some(code) = webhook.auth_script() else {
        return Ok(());
    };

    let invocation = Invocation {
        label: "authorize",
        code: code.to_string(),
        bindings: vec![
            Binding::strings("headers", request.headers.clone()),
            Binding::json("body", request.body.clone()),
            Binding::json("query", Value::Object(request.query.clone())),
            Binding::json("params", Value::Object(request.params.clone())),
        ],
        entry: "authorize(headers, body, query, params)".to_string(),
    };

    match sandbox.run(invocation).await {
        Ok(Some(Value::Bool(true))) => Ok(()),
        Ok(Some(Value::Bool(false))) => {
            tracing::warn!(webhook_id = %webhook.id, "authorization denied");
            Err(PipelineError::Unauthorized)
        }
        Ok(other) => {
            let got = other.map_or_else(|| "undefined".to_string(), |v| v.to_string());
            tracing::warn!(webhook_id = %webhook.id, result = %got, "authorize returned a non-boolean");
            Err(PipelineError::AuthorizationScript(format!(
                "authorize must return a boolean, got {got}"
            )))
        }
        Err(e) => {
            tracing::warn!(webhook_id = %webhook.id, error = %e, "authorization script failed");
            Err(PipelineError::AuthorizationScript(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxLimits;
    use serde_json::json;
    use std::time::Duration;

    fn hook(auth: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            id: "wh".into(),
            organization_id: "org".into(),
            name: String::new(),
            is_active: true,
            auth_code: auth.map(str::to_string),
            transform_code: None,
        }
    }

    fn request() -> InboundRequest {
        let mut req = InboundRequest {
            body: json!({ "messageId": "m1", "event": "sent" }),
            ..Default::default()
        };
        req.headers.insert("x-secret".into(), "s3cr3t".into());
        req.query.insert("tenant".into(), json!("acme"));
        req.params.insert("webhookId".into(), json!("wh"));
        req
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxLimits {
            timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        })
    }

    #[tokio::test]
    async fn missing_script_skips_the_sandbox() {
        let sb = sandbox();
        authorize(&sb, &hook(None), &request()).await.unwrap();
        assert_eq!(sb.stats().created(), 0);
    }

    #[tokio::test]
    async fn script_sees_all_four_inputs() {
        let code = r#"
            function authorize(headers, body, query, params) {
                return headers['x-secret'] === 's3cr3t'
                    && body.messageId === 'm1'
                    && query.tenant === 'acme'
                    && params.webhookId === 'wh';
            }
        "#;
        authorize(&sandbox(), &hook(Some(code)), &request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn false_is_unauthorized() {
        let err = authorize(
            &sandbox(),
            &hook(Some("function authorize() { return false; }")),
            &request(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Unauthorized));
    }

    #[tokio::test]
    async fn truthy_non_boolean_is_a_script_error() {
        for body in ["return 1;", "return 'yes';", "return {};", ""] {
            let code = format!("function authorize() {{ {body} }}");
            let err = authorize(&sandbox(), &hook(Some(&code)), &request())
                .await
                .unwrap_err();
            assert!(
                matches!(err, PipelineError::AuthorizationScript(_)),
                "{body}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn throwing_or_spinning_scripts_are_script_errors() {
        let sb = sandbox();
        for code in [
            "function authorize() { throw new Error('denied'); }",
            "function authorize() { while (true) {} }",
            "not even javascript (",
        ] {
            let err = authorize(&sb, &hook(Some(code)), &request())
                .await
                .unwrap_err();
            assert_eq!(err.public_message(), "Authorization code error");
        }
        assert_eq!(sb.stats().created(), 3);
        assert_eq!(sb.stats().live(), 0);
    }
}
