//! News, events and the resident forum.

use crate::error::{AppError, StoreError};
use crate::model::{Audience, Comment, Event, News, Post, Resident, Role, ScopeKind, Scoped};
use crate::store::{Collections, Direction, Document, DocumentStore, Query, Stored, fetch, fetch_all, insert};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct NewNews {
    pub title: String,
    pub content: String,
    pub audience: Audience,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub time: Option<String>,
    pub location: String,
    pub audience: Audience,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPost {
    pub content: String,
    pub audience: Audience,
}

pub fn visible_to<T: Scoped>(items: Vec<Stored<T>>, rt: &str) -> Vec<Stored<T>> {
    items
        .into_iter()
        .filter(|item| item.doc.audience().visible_to(rt))
        .collect()
}

fn required(value: &str, label: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::Validation(format!("{} wajib diisi.", label)))
    } else {
        Ok(value.to_string())
    }
}

/// Board members of an RT may only address their own block or the estate.
fn check_publisher(author: &Stored<Resident>, audience: &Audience) -> Result<(), AppError> {
    if !author.doc.role.is_board() {
        return Err(AppError::Forbidden);
    }
    let estate_wide = matches!(author.doc.role, Role::KetuaRw | Role::Admin);
    if !estate_wide && !addresses_own_block(author, audience) {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

/// Estate-wide audiences reach every block; an RT audience must be the author's.
fn addresses_own_block(author: &Stored<Resident>, audience: &Audience) -> bool {
    match audience.scope {
        ScopeKind::Rw => true,
        ScopeKind::Rt => audience.rt.as_deref() == Some(author.doc.rt.as_str()),
    }
}

/// An RT audience needs its block number. An RW audience drops any stray one.
fn check_audience(audience: Audience) -> Result<Audience, AppError> {
    match audience.scope {
        ScopeKind::Rt if audience.rt.is_none() => {
            Err(AppError::Validation("Nomor RT wajib diisi.".to_string()))
        }
        ScopeKind::Rt => Ok(audience),
        ScopeKind::Rw => Ok(Audience::estate()),
    }
}

fn toggle_liker(data: &mut Value, resident_id: &str) {
    let Some(post) = data.as_object_mut() else {
        return;
    };
    let mut liked_by: Vec<String> = post
        .get("liked_by")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    match liked_by.iter().position(|id| id == resident_id) {
        Some(index) => {
            liked_by.remove(index);
        }
        None => liked_by.push(resident_id.to_string()),
    }
    post.insert("likes".to_string(), json!(liked_by.len()));
    post.insert("liked_by".to_string(), json!(liked_by));
}

pub struct Community {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
}

impl Community {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections) -> Self {
        Community { store, collections }
    }

    pub fn news_query(&self) -> Query {
        Query::new(self.collections.news()).order_by("created_at", Direction::Desc)
    }

    pub fn events_query(&self) -> Query {
        Query::new(self.collections.events()).order_by("date", Direction::Asc)
    }

    pub fn posts_query(&self) -> Query {
        Query::new(self.collections.posts()).order_by("created_at", Direction::Desc)
    }

    pub async fn create_news(&self, author: &Stored<Resident>, input: NewNews) -> Result<Stored<News>, AppError> {
        let audience = check_audience(input.audience)?;
        check_publisher(author, &audience)?;
        let news = News {
            title: required(&input.title, "Judul")?,
            content: required(&input.content, "Isi berita")?,
            audience,
            author: author.doc.name.clone(),
            created_at: Utc::now(),
        };
        let id = insert(self.store.as_ref(), &self.collections.news(), &news).await?;
        tracing::info!(news_id = %id, "news published");
        Ok(Stored { id, doc: news })
    }

    pub async fn news_for(&self, rt: &str) -> Result<Vec<Stored<News>>, AppError> {
        let news = fetch_all(self.store.as_ref(), &self.news_query()).await?;
        Ok(visible_to(news, rt))
    }

    pub async fn create_event(&self, author: &Stored<Resident>, input: NewEvent) -> Result<Stored<Event>, AppError> {
        let audience = check_audience(input.audience)?;
        check_publisher(author, &audience)?;
        let event = Event {
            title: required(&input.title, "Nama kegiatan")?,
            description: input.description.trim().to_string(),
            date: input.date,
            time: input.time,
            location: required(&input.location, "Lokasi")?,
            audience,
            created_at: Utc::now(),
        };
        let id = insert(self.store.as_ref(), &self.collections.events(), &event).await?;
        tracing::info!(event_id = %id, "event scheduled");
        Ok(Stored { id, doc: event })
    }

    pub async fn events_for(&self, rt: &str) -> Result<Vec<Stored<Event>>, AppError> {
        let events = fetch_all(self.store.as_ref(), &self.events_query()).await?;
        Ok(visible_to(events, rt))
    }

    pub async fn create_post(&self, author: &Stored<Resident>, input: NewPost) -> Result<Stored<Post>, AppError> {
        let audience = check_audience(input.audience)?;
        if !addresses_own_block(author, &audience) {
            return Err(AppError::Forbidden);
        }
        let post = Post {
            author_id: author.id.clone(),
            author_name: author.doc.name.clone(),
            role: author.doc.role,
            content: required(&input.content, "Isi diskusi")?,
            audience,
            likes: 0,
            liked_by: Vec::new(),
            comment_count: 0,
            created_at: Utc::now(),
        };
        let id = insert(self.store.as_ref(), &self.collections.posts(), &post).await?;
        Ok(Stored { id, doc: post })
    }

    pub async fn posts_for(&self, rt: &str) -> Result<Vec<Stored<Post>>, AppError> {
        let posts = fetch_all(self.store.as_ref(), &self.posts_query()).await?;
        Ok(visible_to(posts, rt))
    }

    async fn get_post(&self, post_id: &str) -> Result<Stored<Post>, AppError> {
        fetch::<Post>(self.store.as_ref(), &self.collections.posts(), post_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Diskusi".to_string()))
    }

    /// Likes or unlikes; the counter is always derived from the liker list.
    pub async fn toggle_like(&self, post_id: &str, resident_id: &str) -> Result<Stored<Post>, AppError> {
        let data = self
            .store
            .modify(&self.collections.posts(), post_id, &|data: &mut Value| {
                toggle_liker(data, resident_id)
            })
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => AppError::NotFound("Diskusi".to_string()),
                other => AppError::Store(other),
            })?;
        let document = Document {
            id: post_id.to_string(),
            data,
        };
        Ok(Stored::from_document(&document)?)
    }

    pub async fn add_comment(
        &self,
        post_id: &str,
        author: &Stored<Resident>,
        content: &str,
    ) -> Result<Stored<Comment>, AppError> {
        self.get_post(post_id).await?;
        let comment = Comment {
            author_id: author.id.clone(),
            author_name: author.doc.name.clone(),
            role: author.doc.role,
            content: required(content, "Komentar")?,
            created_at: Utc::now(),
        };
        let id = insert(self.store.as_ref(), &self.collections.comments(post_id), &comment).await?;
        self.store
            .increment(&self.collections.posts(), post_id, "comment_count", 1)
            .await?;
        Ok(Stored { id, doc: comment })
    }

    pub async fn comments(&self, post_id: &str) -> Result<Vec<Stored<Comment>>, AppError> {
        let query = Query::new(self.collections.comments(post_id)).order_by("created_at", Direction::Asc);
        Ok(fetch_all(self.store.as_ref(), &query).await?)
    }
}
