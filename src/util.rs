//! Small helpers shared across modules.

use std::borrow::Cow;
use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Run two fallible tasks concurrently and wait for both.
///
/// The first error wins: `token` is cancelled so anything else bound to it
/// unwinds, the sibling future is dropped, and the error is returned.
pub async fn run_both<A, B, E>(token: &CancellationToken, a: A, b: B) -> Result<(), E>
where
    A: Future<Output = Result<(), E>>,
    B: Future<Output = Result<(), E>>,
{
    let a = async { a.await.inspect_err(|_| token.cancel()) };
    let b = async { b.await.inspect_err(|_| token.cancel()) };
    tokio::try_join!(a, b).map(|((), ())| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expand_tilde() {
        let Ok(home) = std::env::var("HOME") else {
            return;
        };
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/work"), format!("{home}/work"));
        assert_eq!(expand_tilde("/tmp"), "/tmp");
        assert_eq!(expand_tilde("~other"), "~other");
    }

    #[tokio::test]
    async fn test_run_both_waits_for_both() {
        let token = CancellationToken::new();
        let result: Result<(), String> = run_both(
            &token,
            async { Ok(()) },
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            },
        )
        .await;
        assert!(result.is_ok());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_both_first_error_cancels() {
        let token = CancellationToken::new();
        let watcher = token.clone();
        let result: Result<(), String> = run_both(
            &token,
            async { Err("boom".to_string()) },
            async move {
                watcher.cancelled().await;
                Ok(())
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert!(token.is_cancelled());
    }
}
