//! Minimal HTML shells. The real chat front-end is served separately; these
//! pages exist so redirects land somewhere sensible.

use axum::response::Html;

pub async fn index_page() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Agent Gateway</title></head>\
         <body><h1>Agent Gateway</h1><p>Connected. Open the chat client to start a session.</p>\
         </body></html>",
    )
}

pub async fn login_page() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Sign in</title></head>\
         <body><h1>Sign in</h1>\
         <form method=\"post\" action=\"/api/auth/github\"><button type=\"submit\">Sign in with GitHub</button></form>\
         </body></html>",
    )
}

pub async fn setup_page() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Setup</title></head>\
         <body><h1>Setup</h1><p>Connect your assistant account to finish setup.</p>\
         </body></html>",
    )
}
