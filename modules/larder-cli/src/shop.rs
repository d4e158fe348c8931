//! The shop domain: session and browsing slices, the shop API, and the
//! store wiring used by every command.

use std::sync::Arc;

use anyhow::Result;
use larder_cache::{Api, Endpoint, Fetcher, HttpFetcher, Tag};
use larder_common::FileConfig;
use larder_engine::{Action, CombinedReducer, SerializabilityGuard, Slice, Store};
use larder_persist::{
    persist_reducer, persist_store, PersistConfig, Persistor, Storage, LIFECYCLE_ACTIONS,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const AUTH: &str = "auth";
pub const PRODUCTS: &str = "products";

fn text(action: &Action, field: &str) -> Option<String> {
    action
        .payload()
        .get(field)
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Slices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub email: Option<String>,
}

/// Handles `auth/loggedIn {access, refresh, email}`,
/// `auth/tokenRefreshed {access}` and `auth/loggedOut`.
pub struct AuthSlice;

impl Slice for AuthSlice {
    type State = AuthState;

    fn reduce(&self, state: &mut AuthState, action: &Action) {
        match action.kind() {
            "auth/loggedIn" => {
                state.access_token = text(action, "access");
                state.refresh_token = text(action, "refresh");
                state.email = text(action, "email");
            }
            "auth/tokenRefreshed" => {
                if let Some(access) = text(action, "access") {
                    state.access_token = Some(access);
                }
            }
            "auth/loggedOut" => *state = AuthState::default(),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductsState {
    pub selected_category: Option<String>,
    pub search: String,
}

pub struct ProductsSlice;

impl Slice for ProductsSlice {
    type State = ProductsState;

    fn reduce(&self, state: &mut ProductsState, action: &Action) {
        match action.kind() {
            "products/categorySelected" => state.selected_category = text(action, "category"),
            "products/searchChanged" => state.search = text(action, "search").unwrap_or_default(),
            "products/filtersCleared" => *state = ProductsState::default(),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Route table for the shop backend.
pub fn http_fetcher(config: &FileConfig) -> Result<HttpFetcher> {
    Ok(HttpFetcher::from_config(&config.http)?
        .get("getProducts", "/products/")
        .get("getProduct", "/products/{id}/")
        .get("getMyCart", "/carts/me/")
        .get("getMyOrders", "/orders/me/")
        .get("getMyProfile", "/profiles/me/")
        .post("addCartItem", "/cart-items/")
        .patch("updateCartItem", "/cart-items/{id}/")
        .delete("removeCartItem", "/cart-items/{id}/")
        .post("clearCart", "/carts/clear/")
        .post("placeOrder", "/orders/")
        .patch("updateProfile", "/profiles/{id}/"))
}

fn product_tags(args: &serde_json::Value, result: Option<&serde_json::Value>) -> Vec<Tag> {
    let mut tags = vec![Tag::kind("Product")];
    if let Some(id) = args.get("id").filter(|id| !id.is_null()) {
        tags.push(Tag::id("Product", id));
    }
    if let Some(items) = result.and_then(|r| r.as_array()) {
        tags.extend(
            items
                .iter()
                .filter_map(|item| item.get("id"))
                .map(|id| Tag::id("Product", id)),
        );
    }
    tags
}

/// Endpoints and tag wiring of the shop.
pub fn shop_api(config: &FileConfig, fetcher: impl Fetcher) -> Api {
    let session = || vec![Tag::kind("Cart"), Tag::kind("Orders"), Tag::kind("UserProfile")];

    Api::builder(config.cache.reducer_path.clone())
        .keep_unused_for(config.cache.keep_unused_for())
        .endpoint(Endpoint::query("getProducts").provides_with(product_tags))
        .endpoint(Endpoint::query("getProduct").provides_with(product_tags))
        .endpoint(Endpoint::query("getMyCart").provides([Tag::kind("Cart")]))
        .endpoint(Endpoint::query("getMyOrders").provides([Tag::kind("Orders")]))
        .endpoint(Endpoint::query("getMyProfile").provides([Tag::kind("UserProfile")]))
        .endpoint(Endpoint::mutation("addCartItem").invalidates([Tag::kind("Cart")]))
        .endpoint(Endpoint::mutation("updateCartItem").invalidates([Tag::kind("Cart")]))
        .endpoint(Endpoint::mutation("removeCartItem").invalidates([Tag::kind("Cart")]))
        .endpoint(Endpoint::mutation("clearCart").invalidates([Tag::kind("Cart")]))
        .endpoint(
            Endpoint::mutation("placeOrder").invalidates([Tag::kind("Orders"), Tag::kind("Cart")]),
        )
        .endpoint(Endpoint::mutation("updateProfile").invalidates([Tag::kind("UserProfile")]))
        .invalidate_on("auth/loggedIn", move |_| session())
        .invalidate_on("auth/loggedOut", move |_| session())
        .build(fetcher)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// A booted shop store.
pub struct Shop {
    pub store: Store,
    pub api: Api,
    pub persistor: Persistor,
}

impl Shop {
    /// Build the store, hydrate it from `storage` and open it.
    pub async fn boot(
        config: &FileConfig,
        fetcher: impl Fetcher,
        storage: impl Storage,
    ) -> Result<Self> {
        let api = shop_api(config, fetcher);
        let persist = PersistConfig::from_config(config);

        let reducer = CombinedReducer::new()
            .slice(AUTH, AuthSlice)
            .slice(PRODUCTS, ProductsSlice)
            .slice(api.reducer_path(), api.slice());

        let store = Store::builder()
            .gated()
            .middleware(SerializabilityGuard::new().ignore_actions(LIFECYCLE_ACTIONS))
            .middleware(api.middleware())
            .build(persist_reducer(persist.clone(), reducer))?;

        let persistor = persist_store(&store, persist, storage).await;
        info!(revision = store.committed().revision, "Shop store ready");

        Ok(Self {
            store,
            api,
            persistor,
        })
    }

    /// Keep the fetcher's bearer token in step with the auth slice.
    pub fn track_session(&self, fetcher: Arc<HttpFetcher>) {
        fetcher.set_bearer_token(self.auth().access_token);
        self.store.subscribe(move |tree| {
            let auth: AuthState = tree.slice(AUTH).ok().flatten().unwrap_or_default();
            fetcher.set_bearer_token(auth.access_token);
        });
    }

    pub fn auth(&self) -> AuthState {
        self.store
            .get_state()
            .slice(AUTH)
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
