use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::idle::watchdog::IdleHandle;

/// プロセス内のアイドル監視セッション表
///
/// セッション ID からウォッチドッグのハンドルを引く。
/// エントリの削除はタイムアウトフックと明示ログアウトの両方から起きる
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, IdleHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: Uuid, handle: IdleHandle) {
        self.map().insert(session_id, handle);
    }

    pub fn get(&self, session_id: &Uuid) -> Option<IdleHandle> {
        self.map().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &Uuid) -> Option<IdleHandle> {
        self.map().remove(session_id)
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, IdleHandle>> {
        // ロック毒化は連鎖パニックさせず、その場で回復する
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::idle::watchdog::{IdleConfig, IdleState, IdleWatchdog};

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        let handle = IdleWatchdog::spawn(
            IdleConfig {
                idle_timeout: Duration::from_secs(600),
                warning_window: Duration::from_secs(30),
            },
            Box::new(|| {}),
        );

        registry.insert(session_id, handle);
        let found = registry.get(&session_id).unwrap();
        assert_eq!(found.state(), IdleState::Active);

        assert!(registry.remove(&session_id).is_some());
        assert!(registry.remove(&session_id).is_none());
        assert!(registry.get(&session_id).is_none());
    }
}
