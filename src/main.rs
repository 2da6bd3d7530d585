//! sarball command-line entry point

use sarball::SarError;
use sarball::cli::{Args, Runner};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = Runner::new(args).run().await {
        eprintln!("❌ ERROR: {}", user_message(&err));
        std::process::exit(1);
    }
}

/// Map error kinds to distinct user-facing messages
fn user_message(err: &SarError) -> String {
    match err {
        SarError::InvalidRef(msg) => format!(
            "invalid reference: {}\nExpected <registry>/<repo>[:tag|@digest]",
            msg
        ),
        SarError::NotFound(msg) => format!("not found: {}", msg),
        SarError::Unauthorized(msg) => {
            format!("access denied: {}\nCheck --username/--password", msg)
        }
        SarError::PathTraversal(msg) => format!(
            "refusing to extract: {}\nThe archive tried to write outside the destination",
            msg
        ),
        SarError::InvalidArchive(msg) => format!("corrupt or unsupported archive: {}", msg),
        other => other.to_string(),
    }
}
