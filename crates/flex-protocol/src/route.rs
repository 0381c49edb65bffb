//! Control-channel routes.

use flex_core::Lifecycle;
use std::fmt;

/// A request path understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Ping,
    List,
    Create,
    Attach,
    Lifecycle(Lifecycle),
}

impl Route {
    /// Every route, in the order they are documented.
    pub const ALL: [Route; 8] = [
        Route::Ping,
        Route::List,
        Route::Create,
        Route::Attach,
        Route::Lifecycle(Lifecycle::Start),
        Route::Lifecycle(Lifecycle::Stop),
        Route::Lifecycle(Lifecycle::Reboot),
        Route::Lifecycle(Lifecycle::Destroy),
    ];

    /// Matches a request path such as `/ping`.
    ///
    /// A trailing slash is tolerated; anything else returns `None`.
    pub fn parse(path: &str) -> Option<Self> {
        let name = path.strip_prefix('/').unwrap_or(path);
        let name = name.strip_suffix('/').unwrap_or(name);
        Self::ALL.into_iter().find(|route| route.name() == name)
    }

    /// Route name without the leading slash.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::List => "list",
            Self::Create => "create",
            Self::Attach => "attach",
            Self::Lifecycle(op) => op.as_str(),
        }
    }

    /// Request path, e.g. `/ping`.
    pub fn path(&self) -> String {
        format!("/{}", self.name())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_routes() {
        for route in Route::ALL {
            assert_eq!(Route::parse(&route.path()), Some(route));
        }
    }

    #[test]
    fn test_parse_lifecycle() {
        assert_eq!(
            Route::parse("/reboot"),
            Some(Route::Lifecycle(Lifecycle::Reboot))
        );
        assert_eq!(Route::parse("/ping/"), Some(Route::Ping));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Route::parse("/"), None);
        assert_eq!(Route::parse("/pingx"), None);
        assert_eq!(Route::parse("/Ping"), None);
    }
}
