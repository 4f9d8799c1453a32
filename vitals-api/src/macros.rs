//! Utility macros

/// Implement `FromRef<AppState>` so handlers can extract one field of the
/// application state directly.
///
/// ```ignore
/// impl_from_ref!(Arc<QueryService>, service);
/// // handlers may now take `State(service): State<Arc<QueryService>>`
/// ```
#[macro_export]
macro_rules! impl_from_ref {
    ($type:ty, $field:ident) => {
        impl axum::extract::FromRef<$crate::state::AppState> for $type {
            fn from_ref(state: &$crate::state::AppState) -> Self {
                state.$field.clone()
            }
        }
    };
}
