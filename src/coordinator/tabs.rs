use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::protocol::TabId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub active: bool,
}

/// Read access to the browser's open tabs.
#[async_trait]
pub trait TabDirectory: Send + Sync {
    async fn get(&self, id: TabId) -> Result<Option<TabInfo>>;
    /// Active tab of the focused window.
    async fn active_tab(&self) -> Result<Option<TabInfo>>;
    async fn all_tabs(&self) -> Result<Vec<TabInfo>>;
}

/// Tab list kept in memory, ordered by id.
#[derive(Default)]
pub struct MemoryTabs {
    tabs: RwLock<BTreeMap<TabId, TabInfo>>,
}

impl MemoryTabs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a background tab.
    pub fn open(&self, id: TabId, url: &str) {
        self.tabs.write().insert(
            id,
            TabInfo {
                id,
                url: Some(url.to_string()),
                active: false,
            },
        );
    }

    /// Make `id` the only active tab.
    pub fn activate(&self, id: TabId) {
        for tab in self.tabs.write().values_mut() {
            tab.active = tab.id == id;
        }
    }

    pub fn set_url(&self, id: TabId, url: &str) {
        if let Some(tab) = self.tabs.write().get_mut(&id) {
            tab.url = Some(url.to_string());
        }
    }

    pub fn close(&self, id: TabId) {
        self.tabs.write().remove(&id);
    }
}

#[async_trait]
impl TabDirectory for MemoryTabs {
    async fn get(&self, id: TabId) -> Result<Option<TabInfo>> {
        Ok(self.tabs.read().get(&id).cloned())
    }

    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        Ok(self.tabs.read().values().find(|t| t.active).cloned())
    }

    async fn all_tabs(&self) -> Result<Vec<TabInfo>> {
        Ok(self.tabs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_active_tab() {
        let tabs = MemoryTabs::new();
        tabs.open(TabId(1), "https://www.youtube.com/watch?v=a");
        tabs.open(TabId(2), "https://example.com/");
        assert_eq!(tabs.active_tab().await.unwrap(), None);

        tabs.activate(TabId(1));
        tabs.activate(TabId(2));
        let active = tabs.active_tab().await.unwrap().unwrap();
        assert_eq!(active.id, TabId(2));
        assert!(!tabs.get(TabId(1)).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_close_removes_tab() {
        let tabs = MemoryTabs::new();
        tabs.open(TabId(1), "https://www.bilibili.com/video/BV1");
        tabs.close(TabId(1));
        assert!(tabs.all_tabs().await.unwrap().is_empty());
    }
}
