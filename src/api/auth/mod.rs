mod login;
mod oauth;

pub use login::{parse_redirect_request, AuthorizationRequest, LoginFlow, RedirectParams};
pub use oauth::{OAuthTokenClient, TokenClient, TokenError, TokenGrant};
