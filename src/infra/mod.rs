//! HTTP adapters for the external collaborators: concert search, place
//! search and push notification.

pub mod concert_search;
pub mod http_client;
pub mod notifier;
pub mod place_search;

pub use concert_search::HttpConcertSearcher;
pub use notifier::{LogNotifier, WebhookNotifier};
pub use place_search::HttpPlaceSearcher;
