//! Message board storage: the flat news log and the threaded board.
//!
//! Flat news is a byte log with newest posts first, capped in size with
//! the tail truncated. Threaded news is a tree of bundles and
//! categories holding articles with parent/child threading, persisted
//! as `ThreadedNews.yaml`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Divider written between flat-news posts.
pub const FLAT_NEWS_DIVIDER: &str = "__________________________________________________________";

/// Render a flat-news post: attribution line, body, divider.
pub fn format_flat_post(user_name: &[u8], posted_at: DateTime<Utc>, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"From ");
    out.extend_from_slice(user_name);
    out.extend_from_slice(format!(" ({}):\r\r", posted_at.format("%b%d %H:%M")).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r");
    out.extend_from_slice(FLAT_NEWS_DIVIDER.as_bytes());
    out.extend_from_slice(b"\r");
    out
}

/// Prepend `post` to `board`, truncating the tail to `limit` bytes so
/// the newest posts survive.
pub fn prepend_flat_post(board: &mut Vec<u8>, post: &[u8], limit: usize) {
    let mut updated = Vec::with_capacity(post.len() + board.len());
    updated.extend_from_slice(post);
    updated.extend_from_slice(board);
    updated.truncate(limit);
    *board = updated;
}

/// Kind of a threaded-news container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryKind {
    /// Holds other containers.
    Bundle,
    /// Holds articles.
    Category,
}

/// One article on the threaded board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    /// Server-unique monotonically increasing ID.
    pub id: u32,
    /// Parent article ID; 0 for top-level posts.
    pub parent_id: u32,
    /// Title line.
    pub title: String,
    /// Poster's user name.
    pub poster: String,
    /// Post time.
    pub date: DateTime<Utc>,
    /// MIME flavor of the body; always `text/plain` here.
    pub flavor: String,
    /// Body bytes.
    pub data: String,
}

/// A node of the threaded-news tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsCategory {
    /// Bundle or category.
    pub kind: CategoryKind,
    /// Child containers, by name.
    #[serde(default)]
    pub children: BTreeMap<String, NewsCategory>,
    /// Articles, by ID (categories only).
    #[serde(default)]
    pub articles: BTreeMap<u32, NewsArticle>,
}

impl NewsCategory {
    /// Create an empty container.
    pub fn new(kind: CategoryKind) -> Self {
        Self { kind, children: BTreeMap::new(), articles: BTreeMap::new() }
    }
}

/// The whole threaded board.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadedNews {
    /// Top-level containers.
    #[serde(default)]
    pub categories: BTreeMap<String, NewsCategory>,
    /// Next article ID to assign.
    #[serde(default)]
    pub next_article_id: u32,
}

impl ThreadedNews {
    /// Walk `path` (container names, root-most first) to a node.
    pub fn node(&self, path: &[String]) -> Result<&NewsCategory> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| Error::NotFound("news path is empty".into()))?;
        let mut node = self
            .categories
            .get(first)
            .ok_or_else(|| Error::NotFound(format!("news category {}", first)))?;
        for name in rest {
            node = node
                .children
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("news category {}", name)))?;
        }
        Ok(node)
    }

    /// Mutable variant of [`node`](Self::node).
    pub fn node_mut(&mut self, path: &[String]) -> Result<&mut NewsCategory> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| Error::NotFound("news path is empty".into()))?;
        let mut node = self
            .categories
            .get_mut(first)
            .ok_or_else(|| Error::NotFound(format!("news category {}", first)))?;
        for name in rest {
            node = node
                .children
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("news category {}", name)))?;
        }
        Ok(node)
    }

    /// List the containers under `path` (the top level for an empty
    /// path), as (name, kind, child count) tuples.
    pub fn list(&self, path: &[String]) -> Result<Vec<(String, CategoryKind, u16)>> {
        let children = if path.is_empty() {
            &self.categories
        } else {
            &self.node(path)?.children
        };
        Ok(children
            .iter()
            .map(|(name, node)| {
                let count = match node.kind {
                    CategoryKind::Bundle => node.children.len(),
                    CategoryKind::Category => node.articles.len(),
                };
                (name.clone(), node.kind, count as u16)
            })
            .collect())
    }

    /// Insert a new container under `path`.
    pub fn create(&mut self, path: &[String], name: &str, kind: CategoryKind) -> Result<()> {
        let children = if path.is_empty() {
            &mut self.categories
        } else {
            &mut self.node_mut(path)?.children
        };
        if children.contains_key(name) {
            return Err(Error::Storage(format!("news category {} already exists", name)));
        }
        children.insert(name.to_string(), NewsCategory::new(kind));
        Ok(())
    }

    /// Remove the container named by the last element of `path`.
    pub fn remove(&mut self, path: &[String]) -> Result<NewsCategory> {
        let (name, parent) = path
            .split_last()
            .ok_or_else(|| Error::NotFound("news path is empty".into()))?;
        let children = if parent.is_empty() {
            &mut self.categories
        } else {
            &mut self.node_mut(parent)?.children
        };
        children
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("news category {}", name)))
    }

    /// Post an article into the category at `path`, returning the
    /// assigned ID.
    pub fn post_article(
        &mut self,
        path: &[String],
        parent_id: u32,
        title: &str,
        poster: &str,
        date: DateTime<Utc>,
        data: &str,
    ) -> Result<u32> {
        self.next_article_id += 1;
        let id = self.next_article_id;
        let node = self.node_mut(path)?;
        if node.kind != CategoryKind::Category {
            return Err(Error::Storage("articles can only be posted into categories".into()));
        }
        node.articles.insert(
            id,
            NewsArticle {
                id,
                parent_id,
                title: title.to_string(),
                poster: poster.to_string(),
                date,
                flavor: "text/plain".to_string(),
                data: data.to_string(),
            },
        );
        Ok(id)
    }

    /// Delete an article and its replies from the category at `path`.
    pub fn delete_article(&mut self, path: &[String], id: u32) -> Result<()> {
        let node = self.node_mut(path)?;
        if node.articles.remove(&id).is_none() {
            return Err(Error::NotFound(format!("news article {}", id)));
        }
        // Cascade to replies so no article is left pointing at a
        // removed parent.
        let mut doomed: Vec<u32> = vec![id];
        while let Some(parent) = doomed.pop() {
            let children: Vec<u32> = node
                .articles
                .values()
                .filter(|a| a.parent_id == parent)
                .map(|a| a.id)
                .collect();
            for child in &children {
                node.articles.remove(child);
            }
            doomed.extend(children);
        }
        Ok(())
    }

    /// Sibling navigation for an article: (prev, next, first child) IDs,
    /// 0 where absent. Siblings share a parent and are ordered by ID.
    pub fn neighbors(&self, path: &[String], id: u32) -> Result<(u32, u32, u32)> {
        let node = self.node(path)?;
        let article = node
            .articles
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("news article {}", id)))?;
        let siblings: Vec<u32> = node
            .articles
            .values()
            .filter(|a| a.parent_id == article.parent_id)
            .map(|a| a.id)
            .collect();
        let pos = siblings.iter().position(|&s| s == id).unwrap_or(0);
        let prev = if pos > 0 { siblings[pos - 1] } else { 0 };
        let next = siblings.get(pos + 1).copied().unwrap_or(0);
        let first_child =
            node.articles.values().filter(|a| a.parent_id == id).map(|a| a.id).next().unwrap_or(0);
        Ok((prev, next, first_child))
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2003, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_flat_post_format_and_prepend() {
        let post = format_flat_post(b"Testy McTest", date(), b"hello board");
        let text = String::from_utf8_lossy(&post).into_owned();
        assert!(text.starts_with("From Testy McTest (Jun01 12:00):\r\rhello board\r"));
        assert!(text.contains(FLAT_NEWS_DIVIDER));

        let mut board = b"OLD".to_vec();
        prepend_flat_post(&mut board, &post, 1 << 16);
        assert!(board.starts_with(&post));
        assert!(board.ends_with(b"OLD"));
    }

    #[test]
    fn test_flat_tail_truncation_keeps_newest() {
        let mut board = vec![b'o'; 40];
        prepend_flat_post(&mut board, b"NEW ", 16);
        assert_eq!(board.len(), 16);
        assert!(board.starts_with(b"NEW "));
    }

    #[test]
    fn test_tree_create_list_post() {
        let mut news = ThreadedNews::default();
        news.create(&[], "General", CategoryKind::Category).expect("create");
        news.create(&[], "Archives", CategoryKind::Bundle).expect("create");
        news.create(&["Archives".into()], "2003", CategoryKind::Category).expect("create nested");

        let listing = news.list(&[]).expect("list");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0], ("Archives".to_string(), CategoryKind::Bundle, 1));

        let path = vec!["General".to_string()];
        let id = news.post_article(&path, 0, "First", "guest", date(), "body").expect("post");
        assert_eq!(id, 1);
        let id2 = news.post_article(&path, id, "Re: First", "admin", date(), "reply").expect("post");
        assert_eq!(id2, 2);
        assert_eq!(news.node(&path).expect("node").articles.len(), 2);

        // Duplicate names are rejected.
        assert!(news.create(&[], "General", CategoryKind::Category).is_err());
    }

    #[test]
    fn test_article_ids_monotonic_across_categories() {
        let mut news = ThreadedNews::default();
        news.create(&[], "A", CategoryKind::Category).expect("create");
        news.create(&[], "B", CategoryKind::Category).expect("create");
        let a = news.post_article(&["A".into()], 0, "t", "p", date(), "x").expect("post");
        let b = news.post_article(&["B".into()], 0, "t", "p", date(), "x").expect("post");
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_delete_article_cascades_to_replies() {
        let mut news = ThreadedNews::default();
        let path = vec!["General".to_string()];
        news.create(&[], "General", CategoryKind::Category).expect("create");
        let root = news.post_article(&path, 0, "root", "p", date(), "x").expect("post");
        let child = news.post_article(&path, root, "re", "p", date(), "x").expect("post");
        let _grand = news.post_article(&path, child, "re re", "p", date(), "x").expect("post");
        let other = news.post_article(&path, 0, "other", "p", date(), "x").expect("post");

        news.delete_article(&path, root).expect("delete");
        let node = news.node(&path).expect("node");
        assert_eq!(node.articles.keys().copied().collect::<Vec<_>>(), vec![other]);
    }

    #[test]
    fn test_neighbors() {
        let mut news = ThreadedNews::default();
        let path = vec!["General".to_string()];
        news.create(&[], "General", CategoryKind::Category).expect("create");
        let a = news.post_article(&path, 0, "a", "p", date(), "x").expect("post");
        let b = news.post_article(&path, 0, "b", "p", date(), "x").expect("post");
        let c = news.post_article(&path, 0, "c", "p", date(), "x").expect("post");
        let reply = news.post_article(&path, b, "re b", "p", date(), "x").expect("post");

        assert_eq!(news.neighbors(&path, b).expect("neighbors"), (a, c, reply));
        assert_eq!(news.neighbors(&path, a).expect("neighbors"), (0, b, 0));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut news = ThreadedNews::default();
        news.create(&[], "General", CategoryKind::Category).expect("create");
        news.post_article(&["General".into()], 0, "t", "p", date(), "body").expect("post");

        let yaml = news.to_yaml().expect("to yaml");
        let parsed = ThreadedNews::from_yaml(&yaml).expect("from yaml");
        assert_eq!(parsed, news);
    }
}
