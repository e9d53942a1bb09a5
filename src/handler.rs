//! GraphQL HTTP glue
//!
//! Every request executes with its own [`LoaderRegistry`], so loaders and
//! their memoized results never outlive or cross a request.

use async_graphql::{Request, Response, Schema};
use axum::{extract::Extension, Json};

use crate::dataloaders::LoaderRegistry;

/// Attach a fresh loader registry to a GraphQL request
pub fn with_loader_registry(request: Request) -> Request {
    let registry = LoaderRegistry::new();
    tracing::debug!(scope = %registry.scope(), "loader registry created");
    request.data(registry)
}

/// Standard GraphQL handler with per-request loader injection
///
/// # Example
///
/// ```rust,no_run
/// use axum::{Router, routing::post};
/// use pleme_graphql_presets::handler::graphql_handler;
/// use async_graphql::{EmptyMutation, EmptySubscription};
///
/// # struct Query;
/// # #[async_graphql::Object]
/// # impl Query { async fn ok(&self) -> bool { true } }
/// let app: Router = Router::new()
///     .route("/graphql", post(graphql_handler::<Query, EmptyMutation, EmptySubscription>));
/// ```
pub async fn graphql_handler<Query, Mutation, Subscription>(
    Extension(schema): Extension<Schema<Query, Mutation, Subscription>>,
    req: Json<Request>,
) -> Json<Response>
where
    Query: async_graphql::ObjectType + 'static,
    Mutation: async_graphql::ObjectType + 'static,
    Subscription: async_graphql::SubscriptionType + 'static,
{
    let request = with_loader_registry(req.0);
    let response = schema.execute(request).await;
    Json(response)
}
