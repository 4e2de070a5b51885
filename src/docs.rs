use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::wallet::get_user_coin,
        crate::api::wallet::coin_cost,
        crate::api::pricing::get_pricing,
        crate::api::pricing::get_coin_pricing,
        crate::api::pricing::get_promo,
        crate::api::pricing::verify_promo,
        crate::api::checkout::create_checkout_session,
        crate::api::subscriptions::subscription_status,
        crate::api::generate::generate_chat,
        crate::api::generate::generate_image,
        crate::api::generate::generate_video,
        crate::api::generate::create_character,
        crate::api::admin::set_app_config,
        crate::api::admin::upsert_pricing,
        crate::api::webhooks::stripe_webhook
    ),
    components(
        schemas(
            crate::models::User,
            crate::models::UserWallet,
            crate::models::PricingPlan,
            crate::models::Subscription,
            crate::models::PromoManagement,
            crate::api::pricing::VerifyPromoRequest,
            crate::api::checkout::CreateCheckoutRequest,
            crate::api::generate::ChatRequest,
            crate::api::generate::MediaRequest,
            crate::api::admin::AppConfigRequest,
            crate::api::admin::PricingUpsertRequest
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "wallet", description = "Coin balance and costs"),
        (name = "pricing", description = "Plans and promo codes"),
        (name = "checkout", description = "Checkout sessions"),
        (name = "subscriptions", description = "Subscription state"),
        (name = "generate", description = "Paid generation features"),
        (name = "admin", description = "Runtime configuration"),
        (name = "webhooks", description = "Payment provider callbacks")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
