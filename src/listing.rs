//! Things returned by the API: posts, comments, "more" placeholders,
//! subreddits and accounts, plus the `Listing` envelope they travel in.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Depth of a comment that has not been placed in a tree yet.
pub const UNATTACHED_DEPTH: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Kind {
    #[serde(rename = "t1")]
    Comment,
    #[serde(rename = "t2")]
    Account,
    #[serde(rename = "t3")]
    Link,
    #[serde(rename = "t4")]
    Message,
    #[serde(rename = "t5")]
    Subreddit,
    #[serde(rename = "more")]
    More,
}

impl Kind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Kind::Comment => "t1",
            Kind::Account => "t2",
            Kind::Link => "t3",
            Kind::Message => "t4",
            Kind::Subreddit => "t5",
            Kind::More => "more",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "t1" => Some(Kind::Comment),
            "t2" => Some(Kind::Account),
            "t3" => Some(Kind::Link),
            "t4" => Some(Kind::Message),
            "t5" => Some(Kind::Subreddit),
            "more" => Some(Kind::More),
            _ => None,
        }
    }

    pub fn fullname(&self, id: &str) -> String {
        format!("{}_{}", self.prefix(), id)
    }

    /// Splits `t3_abc` into its kind and id.
    pub fn parse_fullname(fullname: &str) -> Option<(Kind, &str)> {
        let (prefix, id) = fullname.split_once('_')?;
        if id.is_empty() {
            return None;
        }
        Kind::from_prefix(prefix).map(|kind| (kind, id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VoteType {
    Up,
    Down,
    #[default]
    None,
}

impl VoteType {
    pub fn value(self) -> i32 {
        match self {
            VoteType::Up => 1,
            VoteType::Down => -1,
            VoteType::None => 0,
        }
    }

    /// The `dir` form parameter of `/api/vote`.
    pub fn direction(self) -> i32 {
        self.value()
    }

    pub fn from_likes(likes: Option<bool>) -> Self {
        match likes {
            Some(true) => VoteType::Up,
            Some(false) => VoteType::Down,
            None => VoteType::None,
        }
    }

    pub fn likes(self) -> Option<bool> {
        match self {
            VoteType::Up => Some(true),
            VoteType::Down => Some(false),
            VoteType::None => None,
        }
    }

    /// Pressing the button of the current vote clears it.
    pub fn toggled(self, requested: VoteType) -> VoteType {
        if self == requested {
            VoteType::None
        } else {
            requested
        }
    }
}

fn likes_as_vote<'de, D>(deserializer: D) -> Result<VoteType, D::Error>
where
    D: Deserializer<'de>,
{
    let likes = Option::<bool>::deserialize(deserializer)?;
    Ok(VoteType::from_likes(likes))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn unattached_depth() -> i32 {
    UNATTACHED_DEPTH
}

/// Fields every listing shares. The kind and fullname are not stored: they
/// follow from the concrete type (see [`ThingData`]), which keeps
/// `fullname == kind + "_" + id` true by construction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListingBase {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default, alias = "over18", deserialize_with = "null_as_default")]
    pub over_18: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub permalink: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub stickied: bool,
    #[serde(default)]
    pub distinguished: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub score_hidden: bool,
    #[serde(default, rename = "likes", deserialize_with = "likes_as_vote")]
    pub vote: VoteType,
    #[serde(default)]
    pub saved: bool,
}

impl ListingBase {
    /// Moves the vote to `vote` and adjusts the score by the signed delta.
    /// Returns the previous vote; voting the current vote again changes nothing.
    pub fn apply_vote(&mut self, vote: VoteType) -> VoteType {
        let previous = self.vote;
        if previous == vote {
            return previous;
        }
        self.score += i64::from(vote.value() - previous.value());
        self.vote = vote;
        previous
    }

    pub fn apply_saved(&mut self, saved: bool) -> bool {
        std::mem::replace(&mut self.saved, saved)
    }

    pub fn created_at(&self) -> Option<SystemTime> {
        if self.created_utc <= 0.0 {
            return None;
        }
        let secs = self.created_utc.trunc() as u64;
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Access to the shared fields of a concrete thing.
pub trait ThingData {
    const KIND: Kind;

    fn base(&self) -> &ListingBase;
    fn base_mut(&mut self) -> &mut ListingBase;

    fn kind(&self) -> Kind {
        Self::KIND
    }

    fn fullname(&self) -> String {
        Self::KIND.fullname(&self.base().id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Post {
    #[serde(flatten)]
    pub base: ListingBase,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub selftext: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub thumbnail: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub domain: String,
    #[serde(default)]
    pub spoiler: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub post_hint: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_gallery: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub preview: Preview,
    #[serde(default)]
    pub gallery_data: Option<GalleryData>,
    #[serde(default)]
    pub media_metadata: Option<HashMap<String, MediaMetadata>>,
    #[serde(default)]
    pub crosspost_parent: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub crosspost_parent_list: Vec<Post>,
}

impl ThingData for Post {
    const KIND: Kind = Kind::Link;

    fn base(&self) -> &ListingBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ListingBase {
        &mut self.base
    }
}

impl Post {
    /// Full-size gallery images in display order. Crossposts carry their
    /// gallery on the parent post.
    pub fn gallery_images(&self) -> Vec<MediaMetadataImage> {
        let source = if self.media_metadata.is_some() {
            self
        } else if let Some(parent) = self
            .crosspost_parent_list
            .iter()
            .find(|parent| parent.media_metadata.is_some())
        {
            parent
        } else {
            return Vec::new();
        };
        let (Some(gallery), Some(metadata)) = (&source.gallery_data, &source.media_metadata) else {
            return Vec::new();
        };
        gallery
            .items
            .iter()
            .filter_map(|item| metadata.get(&item.media_id))
            .filter(|meta| meta.status.is_empty() || meta.status == "valid")
            .map(|meta| meta.full.clone())
            .collect()
    }

    /// A gallery crosspost that arrived without its parent's media.
    pub fn needs_gallery_expansion(&self) -> bool {
        self.is_gallery
            && self.media_metadata.is_none()
            && self.crosspost_parent.is_some()
            && !self
                .crosspost_parent_list
                .iter()
                .any(|parent| parent.media_metadata.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PreviewImage {
    #[serde(default)]
    pub source: PreviewSource,
    #[serde(default)]
    pub resolutions: Vec<PreviewSource>,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PreviewSource {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GalleryData {
    #[serde(default)]
    pub items: Vec<GalleryItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GalleryItem {
    #[serde(default)]
    pub id: i64,
    pub media_id: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaMetadata {
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "e")]
    pub kind: String,
    #[serde(default, rename = "m")]
    pub mime: String,
    #[serde(default, rename = "s")]
    pub full: MediaMetadataImage,
    #[serde(default, rename = "p")]
    pub previews: Vec<MediaMetadataImage>,
    #[serde(default)]
    pub id: String,
}

/// Gallery media uses short keys (`u`, `x`, `y`); some payloads spell them out.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaMetadataImage {
    #[serde(default, rename = "u", alias = "url")]
    pub url: String,
    #[serde(default, rename = "x", alias = "width")]
    pub width: i64,
    #[serde(default, rename = "y", alias = "height")]
    pub height: i64,
    #[serde(default)]
    pub gif: Option<String>,
    #[serde(default)]
    pub mp4: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Comment {
    #[serde(flatten)]
    pub base: ListingBase,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub link_id: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default = "unattached_depth")]
    pub depth: i32,
    /// Either a nested listing or `""` when there are no replies.
    #[serde(default, deserialize_with = "replies_or_empty")]
    pub replies: Vec<CommentChild>,
}

impl ThingData for Comment {
    const KIND: Kind = Kind::Comment;

    fn base(&self) -> &ListingBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ListingBase {
        &mut self.base
    }
}

fn replies_or_empty<'de, D>(deserializer: D) -> Result<Vec<CommentChild>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    if !raw.is_object() {
        return Ok(Vec::new());
    }
    let envelope: ListingEnvelope<CommentChild> =
        serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
    Ok(envelope.data.children)
}

/// Stands in for child comments that were not sent with the page.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MoreChildren {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub depth: i32,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub children: Vec<String>,
}

impl MoreChildren {
    pub fn fullname(&self) -> String {
        Kind::More.fullname(&self.id)
    }

    /// "Continue this thread" links carry no child ids and must be opened as
    /// a new comments page instead of expanded in place.
    pub fn is_continue_thread(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum CommentChild {
    #[serde(rename = "t1")]
    Comment(Box<Comment>),
    #[serde(rename = "more")]
    More(MoreChildren),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Subreddit {
    #[serde(flatten)]
    pub base: ListingBase,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub display_name_prefixed: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_description: String,
    #[serde(default)]
    pub subscribers: Option<i64>,
    #[serde(default)]
    pub user_is_subscriber: Option<bool>,
    #[serde(default)]
    pub user_is_moderator: Option<bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subreddit_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub icon_img: String,
}

impl ThingData for Subreddit {
    const KIND: Kind = Kind::Subreddit;

    fn base(&self) -> &ListingBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ListingBase {
        &mut self.base
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub base: ListingBase,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub link_karma: i64,
    #[serde(default)]
    pub comment_karma: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub icon_img: String,
    #[serde(default)]
    pub is_gold: bool,
    #[serde(default)]
    pub is_mod: bool,
    #[serde(default)]
    pub verified: bool,
}

impl ThingData for User {
    const KIND: Kind = Kind::Account;

    fn base(&self) -> &ListingBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ListingBase {
        &mut self.base
    }
}

/// Any thing, discriminated by its `kind`. Mixed listings such as a user
/// overview decode into this.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum AnyThing {
    #[serde(rename = "t1")]
    Comment(Box<Comment>),
    #[serde(rename = "t2")]
    User(Box<User>),
    #[serde(rename = "t3")]
    Post(Box<Post>),
    #[serde(rename = "t5")]
    Subreddit(Box<Subreddit>),
    #[serde(rename = "more")]
    More(MoreChildren),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Listing<T> {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub children: Vec<T>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            children: Vec::new(),
        }
    }
}

impl<T> Listing<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Listing<U> {
        Listing {
            after: self.after,
            before: self.before,
            children: self.children.into_iter().map(f).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Thing<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingEnvelope<T> {
    #[serde(default)]
    pub kind: String,
    pub data: Listing<T>,
}
