use anyhow::Result;
use utoipa::openapi::{
    OpenApi,
    security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::platform::middleware::SESSION_HEADER;

pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";

/// Registers the `bearerAuth` and `sessionId` schemes referenced by the route docs.
pub fn with_security_schemes(mut openapi: OpenApi) -> OpenApi {
    let components = openapi.components.get_or_insert_with(Default::default);
    components.add_security_scheme(
        "bearerAuth",
        SecurityScheme::Http(
            HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .build(),
        ),
    );
    components.add_security_scheme(
        "sessionId",
        SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(SESSION_HEADER))),
    );
    openapi
}

pub fn create_swagger_ui(openapi: OpenApi) -> Result<SwaggerUi> {
    Ok(SwaggerUi::new("/swagger-ui").url(OPENAPI_JSON_PATH, with_security_schemes(openapi)))
}

#[cfg(test)]
mod tests {
    use utoipa::openapi::OpenApiBuilder;

    use super::*;

    #[test]
    fn registers_both_schemes() {
        let openapi = with_security_schemes(OpenApiBuilder::new().build());
        let schemes = openapi.components.unwrap().security_schemes;
        assert!(schemes.contains_key("bearerAuth"));
        assert!(schemes.contains_key("sessionId"));
    }
}
