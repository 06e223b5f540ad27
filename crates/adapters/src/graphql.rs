//! The GraphQL adapter.
//!
//! Deliberately not a query engine: validation is structural (brace
//! depth, regex field counting, dangerous-pattern screening) and each
//! top-level field maps straight onto a kernel invocation through a
//! registered resolver table.

use async_trait::async_trait;
use manifold_core::context::{Protocol, RequestContext};
use manifold_core::envelope::WireResponse;
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::kernel::{KernelExecutor, KernelInvocation};
use manifold_manifest::Manifest;
use regex_lite::Regex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use crate::{actions, identity};

static FIELD_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*\s*[({:]").expect("complexity pattern"));

static INTROSPECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__schema\b|__type\b").expect("introspection pattern"));

static FRAGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fragment\s+([A-Za-z_][A-Za-z0-9_]*)").expect("fragment pattern"));

/// Maximum brace nesting of the query text.
pub fn query_depth(query: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for c in query.chars() {
        match c {
            '{' => {
                depth += 1;
                max = max.max(depth);
            }
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Cheap complexity metric: the number of `word(`/`word{`/`word:` tokens.
pub fn query_complexity(query: &str) -> usize {
    FIELD_TOKEN_RE.find_iter(query).count()
}

/// Whether the query text says `mutation` anywhere before its first
/// selection set.
pub fn is_mutation(query: &str) -> bool {
    match query.find('{') {
        Some(idx) => query[..idx].contains("mutation"),
        None => query.contains("mutation"),
    }
}

/// Top-level field names of the first selection set.
pub fn top_level_fields(query: &str) -> Vec<String> {
    let Some(start) = query.find('{') else {
        return Vec::new();
    };
    let mut fields = Vec::new();
    let mut brace_depth = 0usize;
    let mut paren_depth = 0usize;
    let mut token = String::new();
    let mut token_is_field = true;

    for c in query[start..].chars() {
        match c {
            '{' => {
                brace_depth += 1;
                token_is_field = true;
                token.clear();
            }
            '}' => {
                brace_depth = brace_depth.saturating_sub(1);
                if brace_depth == 0 {
                    break;
                }
                token.clear();
                token_is_field = true;
            }
            '(' => {
                if brace_depth == 1 && paren_depth == 0 && token_is_field && !token.is_empty() {
                    fields.push(token.clone());
                    token_is_field = false;
                }
                paren_depth += 1;
                token.clear();
            }
            ')' => {
                paren_depth = paren_depth.saturating_sub(1);
                if paren_depth == 0 {
                    // whatever follows the argument list starts fresh
                    token_is_field = true;
                    token.clear();
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                if paren_depth == 0 {
                    token.push(c);
                }
            }
            _ => {
                if brace_depth == 1 && paren_depth == 0 && token_is_field && !token.is_empty() {
                    fields.push(token.clone());
                    token_is_field = matches!(c, ',' | '\n' | ' ' | '\t' | '\r');
                }
                token.clear();
                if matches!(c, ',' | '\n') {
                    token_is_field = true;
                }
            }
        }
    }
    if brace_depth == 1 && token_is_field && !token.is_empty() {
        fields.push(token);
    }
    fields
}

/// Detect a fragment that spreads itself inside its own body.
pub fn has_recursive_fragment(query: &str) -> bool {
    for capture in FRAGMENT_RE.captures_iter(query) {
        let Some(name) = capture.get(1) else { continue };
        let after = &query[name.end()..];
        let Some(open) = after.find('{') else { continue };
        let mut depth = 0usize;
        let mut body_end = after.len();
        for (i, c) in after[open..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        body_end = open + i;
                        break;
                    }
                }
                _ => {}
            }
        }
        let body = &after[open..body_end];
        if body.contains(&format!("...{}", name.as_str())) {
            return true;
        }
    }
    false
}

/// How a resolver produces its kernel code string.
#[derive(Debug, Clone)]
enum ResolverCode {
    Fixed(&'static str),
    EngineByName,
    ExecuteAction,
    Schema,
}

/// GraphQL surface over the kernel.
pub struct GraphqlAdapter {
    manifest: Arc<Manifest>,
    mount: String,
    resolvers: HashMap<String, ResolverCode>,
    /// Field → required permission.
    permissions: HashMap<String, String>,
}

impl GraphqlAdapter {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let mount = manifest
            .mount_path("graphql")
            .unwrap_or("/graphql")
            .to_string();
        let resolvers = HashMap::from([
            ("Query.health".to_string(), ResolverCode::Fixed("system.health()")),
            ("Query.engines".to_string(), ResolverCode::Fixed("registry.listEngines()")),
            ("Query.actions".to_string(), ResolverCode::Fixed("registry.listActions()")),
            ("Query.engine".to_string(), ResolverCode::EngineByName),
            ("Query.__schema".to_string(), ResolverCode::Schema),
            ("Mutation.execute".to_string(), ResolverCode::ExecuteAction),
        ]);
        Self {
            manifest,
            mount,
            resolvers,
            permissions: HashMap::new(),
        }
    }

    /// Require `permission` to resolve `field` (e.g. `Mutation.execute`).
    pub fn with_permission(mut self, field: &str, permission: &str) -> Self {
        self.permissions.insert(field.into(), permission.into());
        self
    }

    fn schema_document(&self) -> Value {
        let mut by_op: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for key in self.resolvers.keys() {
            if let Some((op, field)) = key.split_once('.') {
                if !field.starts_with("__") {
                    by_op.entry(match op {
                        "Mutation" => "Mutation",
                        _ => "Query",
                    })
                    .or_default()
                    .push(field);
                }
            }
        }
        let mut sdl = String::new();
        for (op, mut fields) in by_op {
            fields.sort();
            sdl.push_str(&format!("type {op} {{\n"));
            for field in fields {
                sdl.push_str(&format!("  {field}: JSON\n"));
            }
            sdl.push_str("}\n");
        }
        json!({"sdl": sdl})
    }

    fn validate_structure(&self, query: &str) -> Result<(), GatewayError> {
        let limits = self.manifest.rate_limits.graphql;

        if INTROSPECTION_RE.is_match(query) && self.manifest.env.is_production() {
            return Err(GatewayError::forbidden("introspection is disabled in production"));
        }
        if has_recursive_fragment(query) {
            return Err(GatewayError::validation("recursive fragments are not allowed"));
        }

        let depth = query_depth(query);
        if depth > limits.max_depth {
            return Err(GatewayError::new(
                ErrorCode::QueryTooDeep,
                format!("Query depth {depth} exceeds maximum {}", limits.max_depth),
            ));
        }

        let complexity = query_complexity(query);
        if complexity > limits.max_complexity {
            return Err(GatewayError::new(
                ErrorCode::QueryTooComplex,
                format!(
                    "Query complexity {complexity} exceeds maximum {}",
                    limits.max_complexity
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl crate::ProtocolAdapter for GraphqlAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Graphql
    }

    fn mount_path(&self) -> &str {
        &self.mount
    }

    fn describe(&self) -> Option<Value> {
        Some(self.schema_document())
    }

    async fn handle(
        &self,
        ctx: &mut RequestContext,
        kernel: &dyn KernelExecutor,
    ) -> Result<Value, GatewayError> {
        let body = ctx
            .sanitized_input
            .clone()
            .or_else(|| ctx.body.clone())
            .ok_or_else(|| GatewayError::validation("GraphQL requests require a JSON body"))?;
        let query = body
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("request body must carry a \"query\" string"))?;
        let variables = body.get("variables").cloned().unwrap_or(Value::Null);

        self.validate_structure(query)?;

        let fields = top_level_fields(query);
        if fields.is_empty() {
            return Err(GatewayError::validation("query selects no fields"));
        }
        let operation = if is_mutation(query) { "Mutation" } else { "Query" };
        let (tenant_id, user_id) = identity(ctx);

        let mut data = serde_json::Map::new();
        for field in fields {
            let key = format!("{operation}.{field}");
            let resolver = self
                .resolvers
                .get(&key)
                .ok_or_else(|| GatewayError::validation(format!("cannot resolve field {key:?}")))?;

            if let Some(required) = self.permissions.get(&key) {
                let held = ctx
                    .auth
                    .as_ref()
                    .is_some_and(|a| a.has_permission(required));
                if !held {
                    return Err(GatewayError::forbidden(format!(
                        "field {key:?} requires the {required:?} permission"
                    )));
                }
            }

            let code = match resolver {
                ResolverCode::Fixed(code) => (*code).to_string(),
                ResolverCode::Schema => {
                    data.insert(field, self.schema_document());
                    continue;
                }
                ResolverCode::EngineByName => {
                    let name = variables
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            GatewayError::validation("engine queries require a \"name\" variable")
                        })?;
                    format!("registry.getEngine(\"{name}\")")
                }
                ResolverCode::ExecuteAction => {
                    let action = variables
                        .get("action")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            GatewayError::validation("execute requires an \"action\" variable")
                        })?;
                    actions::validate_action(&self.manifest, action)?;
                    action.to_string()
                }
            };

            let mut invocation = KernelInvocation::new(
                code,
                Protocol::Graphql.as_str(),
                tenant_id.clone(),
                user_id.clone(),
            );
            if !variables.is_null() {
                invocation = invocation.with_input(variables.clone());
            }
            let result = kernel.run(invocation).await?;
            data.insert(field, result);
        }
        Ok(Value::Object(data))
    }

    fn success_response(&self, _ctx: &RequestContext, data: Value) -> WireResponse {
        WireResponse::json(200, json!({"data": data}))
    }

    fn error_response(&self, _ctx: Option<&RequestContext>, err: &GatewayError) -> WireResponse {
        WireResponse::json(
            self.manifest.status_for(err.code),
            json!({
                "errors": [{
                    "message": err.masked_message(self.manifest.mask_errors()),
                    "extensions": {"code": err.code.as_str()},
                }]
            }),
        )
    }
}
