//! Request models: one method per API operation, each issuing a single
//! pipeline call (plus the by-id lookups gallery expansion needs) and
//! decoding the typed result.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::comments::{flatten_children, CommentNode, CommentTree};
use crate::error::{field_errors_from, ApiError};
use crate::listing::{
    AnyThing, Comment, CommentChild, Listing, ListingEnvelope, MoreChildren, Post, Subreddit,
    Thing, ThingData, User, VoteType,
};
use crate::pipeline::{ApiRequest, Pipeline};

/// Pagination cursor. `after` is the fullname of the last item seen (empty
/// for the first page), `count` the number of items already fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub after: String,
    pub count: u32,
    pub limit: Option<u32>,
}

impl Page {
    pub fn first() -> Self {
        Self::default()
    }

    pub fn after(after: impl Into<String>, count: u32) -> Self {
        Self {
            after: after.into(),
            count,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cursor for the page following `listing`, or `None` at the end.
    pub fn next<T>(&self, listing: &Listing<T>) -> Option<Page> {
        let after = listing.after.as_deref().filter(|after| !after.is_empty())?;
        let fetched = u32::try_from(listing.children.len()).unwrap_or(u32::MAX);
        Some(Page {
            after: after.to_string(),
            count: self.count.saturating_add(fetched),
            limit: self.limit,
        })
    }

    fn apply(&self, mut req: ApiRequest) -> ApiRequest {
        if !self.after.is_empty() {
            req = req.query("after", &self.after);
        }
        if self.count > 0 {
            req = req.query("count", self.count);
        }
        if let Some(limit) = self.limit {
            req = req.query("limit", limit);
        }
        req
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortType {
    #[default]
    Best,
    Hot,
    New,
    Top,
    Controversial,
    Rising,
}

impl SortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortType::Best => "best",
            SortType::Hot => "hot",
            SortType::New => "new",
            SortType::Top => "top",
            SortType::Controversial => "controversial",
            SortType::Rising => "rising",
        }
    }

    fn takes_time(&self) -> bool {
        matches!(self, SortType::Top | SortType::Controversial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeFilter {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommentSort {
    #[default]
    Confidence,
    Top,
    New,
    Controversial,
    Old,
    Qa,
}

impl CommentSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentSort::Confidence => "confidence",
            CommentSort::Top => "top",
            CommentSort::New => "new",
            CommentSort::Controversial => "controversial",
            CommentSort::Old => "old",
            CommentSort::Qa => "qa",
        }
    }
}

/// Which listing of a user profile to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserWhere {
    Overview,
    Submitted,
    Comments,
    Saved,
    Upvoted,
    Downvoted,
    Hidden,
}

impl UserWhere {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserWhere::Overview => "overview",
            UserWhere::Submitted => "submitted",
            UserWhere::Comments => "comments",
            UserWhere::Saved => "saved",
            UserWhere::Upvoted => "upvoted",
            UserWhere::Downvoted => "downvoted",
            UserWhere::Hidden => "hidden",
        }
    }

    /// Private listings only the account owner can read.
    fn requires_user(&self) -> bool {
        matches!(
            self,
            UserWhere::Saved | UserWhere::Upvoted | UserWhere::Downvoted | UserWhere::Hidden
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubredditSource {
    Subscriptions,
    Moderated,
    Popular,
    New,
}

impl SubredditSource {
    fn as_path(&self) -> &'static str {
        match self {
            SubredditSource::Subscriptions => "subreddits/mine/subscriber",
            SubredditSource::Moderated => "subreddits/mine/moderator",
            SubredditSource::Popular => "subreddits/popular",
            SubredditSource::New => "subreddits/new",
        }
    }

    fn requires_user(&self) -> bool {
        matches!(
            self,
            SubredditSource::Subscriptions | SubredditSource::Moderated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distinguish {
    Yes,
    No,
    Admin,
    Special,
}

impl Distinguish {
    fn as_str(&self) -> &'static str {
        match self {
            Distinguish::Yes => "yes",
            Distinguish::No => "no",
            Distinguish::Admin => "admin",
            Distinguish::Special => "special",
        }
    }
}

/// A post with its comments flattened in display order.
#[derive(Debug, Clone)]
pub struct PostComments {
    pub post: Post,
    pub comments: Vec<CommentNode>,
}

impl PostComments {
    pub fn into_tree(self) -> (Post, CommentTree) {
        (self.post, CommentTree::from_flat(self.comments))
    }
}

pub struct Client {
    pipeline: Arc<Pipeline>,
}

impl Client {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn front_page(
        &self,
        sort: SortType,
        time: TimeFilter,
        page: &Page,
    ) -> Result<Listing<Post>, ApiError> {
        self.post_listing(sort.as_str().to_string(), sort, time, page)
    }

    pub fn subreddit_posts(
        &self,
        subreddit: &str,
        sort: SortType,
        time: TimeFilter,
        page: &Page,
    ) -> Result<Listing<Post>, ApiError> {
        let name = subreddit_name(subreddit);
        if name.is_empty() {
            return self.front_page(sort, time, page);
        }
        self.post_listing(format!("r/{}/{}", name, sort.as_str()), sort, time, page)
    }

    /// Posts and comments from a user profile. Gallery crossposts are
    /// completed with by-id lookups before returning.
    pub fn user_posts(
        &self,
        username: &str,
        kind: UserWhere,
        sort: SortType,
        time: TimeFilter,
        page: &Page,
    ) -> Result<Listing<AnyThing>, ApiError> {
        let name = username.trim_start_matches("u/");
        let mut req = page.apply(listing_request(format!("user/{}/{}", name, kind.as_str())));
        req = req.query("sort", sort.as_str());
        if sort.takes_time() {
            req = req.query("t", time.as_str());
        }
        if kind.requires_user() {
            req = req.requires_user();
        }
        let envelope: ListingEnvelope<AnyThing> = self.pipeline.execute_json(&req)?;
        let mut listing = envelope.data;
        self.expand_galleries(&mut listing.children)?;
        Ok(listing)
    }

    pub fn subreddits(
        &self,
        source: SubredditSource,
        page: &Page,
    ) -> Result<Listing<Subreddit>, ApiError> {
        let mut req = page.apply(listing_request(source.as_path()));
        if source.requires_user() {
            req = req.requires_user();
        }
        self.fetch_things(&req)
    }

    pub fn search_subreddits(
        &self,
        query: &str,
        include_nsfw: bool,
        page: &Page,
    ) -> Result<Listing<Subreddit>, ApiError> {
        let req = page
            .apply(listing_request("subreddits/search"))
            .query("q", query)
            .query("include_over_18", if include_nsfw { "on" } else { "off" });
        self.fetch_things(&req)
    }

    pub fn subreddit_about(&self, subreddit: &str) -> Result<Subreddit, ApiError> {
        let req = listing_request(format!("r/{}/about", subreddit_name(subreddit)));
        let thing: Thing<Subreddit> = self.pipeline.execute_json(&req)?;
        Ok(thing.data)
    }

    pub fn user_about(&self, username: &str) -> Result<User, ApiError> {
        let req = listing_request(format!("user/{}/about", username.trim_start_matches("u/")));
        let thing: Thing<User> = self.pipeline.execute_json(&req)?;
        Ok(thing.data)
    }

    /// The logged-in account.
    pub fn me(&self) -> Result<User, ApiError> {
        let req = listing_request("api/v1/me").requires_user();
        self.pipeline.execute_json(&req)
    }

    pub fn by_id(&self, fullnames: &[String]) -> Result<Listing<Post>, ApiError> {
        if fullnames.is_empty() {
            return Ok(Listing::default());
        }
        let req = listing_request(format!("by_id/{}", fullnames.join(",")));
        self.fetch_things(&req)
    }

    /// Fetches a post and its comment tree. `focus` narrows the tree to one
    /// comment thread with `context` parent levels above it.
    pub fn comments(
        &self,
        subreddit: &str,
        article: &str,
        sort: CommentSort,
        focus: Option<&str>,
        context: Option<u32>,
    ) -> Result<PostComments, ApiError> {
        let name = subreddit_name(subreddit);
        let path = if name.is_empty() {
            format!("comments/{article}")
        } else {
            format!("r/{name}/comments/{article}")
        };
        let mut req = listing_request(path).query("sort", sort.as_str());
        if let Some(focus) = focus.filter(|focus| !focus.is_empty()) {
            req = req.query("comment", focus);
            if let Some(context) = context {
                req = req.query("context", context);
            }
        }

        let payload: Vec<Value> = self.pipeline.execute_json(&req)?;
        let mut parts = payload.into_iter();
        let (Some(post_part), Some(comment_part)) = (parts.next(), parts.next()) else {
            return Err(ApiError::Decode(
                "comments payload is not a [post, comments] pair".into(),
            ));
        };
        let posts: ListingEnvelope<Thing<Post>> = serde_json::from_value(post_part)?;
        let post = posts
            .data
            .children
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| ApiError::Decode("comments payload has no post".into()))?;
        let comments: ListingEnvelope<CommentChild> = serde_json::from_value(comment_part)?;

        Ok(PostComments {
            post,
            comments: flatten_children(comments.data.children, 0),
        })
    }

    /// Resolves a "more" placeholder into the comments it stands for, in
    /// display order with their depths relative to the whole thread.
    pub fn more_children(
        &self,
        link_fullname: &str,
        more: &MoreChildren,
        sort: CommentSort,
    ) -> Result<Vec<CommentNode>, ApiError> {
        let req = listing_request("api/morechildren")
            .query("api_type", "json")
            .query("link_id", link_fullname)
            .query("children", more.children.join(","))
            .query("sort", sort.as_str());
        let value: Value = self.pipeline.execute_json(&req)?;
        let body = json_body(value)?;
        let things: Vec<CommentChild> = match body.data {
            Some(ThingsData { things }) => things
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()?,
            None => Vec::new(),
        };

        let mut nodes = Vec::with_capacity(things.len());
        for child in things {
            let depth = match &child {
                CommentChild::Comment(comment) => comment.depth,
                CommentChild::More(more) => more.depth,
            };
            nodes.extend(flatten_children(vec![child], depth.max(0)));
        }
        debug!("reddit: morechildren returned {} nodes", nodes.len());
        Ok(nodes)
    }

    pub fn vote(&self, fullname: &str, vote: VoteType) -> Result<(), ApiError> {
        let req = ApiRequest::post("api/vote")
            .form("id", fullname)
            .form("dir", vote.direction())
            .requires_user();
        self.pipeline.execute_empty(&req)
    }

    /// Votes on `thing`, updating its score and vote state up front and
    /// restoring both if the call fails. Without a login nothing changes.
    pub fn vote_with_rollback<T: ThingData>(
        &self,
        thing: &mut T,
        vote: VoteType,
    ) -> Result<(), ApiError> {
        self.pipeline.require_user()?;
        let snapshot = (thing.base().score, thing.base().vote);
        thing.base_mut().apply_vote(vote);
        let result = self.vote(&thing.fullname(), vote);
        if result.is_err() {
            let base = thing.base_mut();
            base.score = snapshot.0;
            base.vote = snapshot.1;
        }
        result
    }

    pub fn save(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/save", fullname)
    }

    pub fn unsave(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/unsave", fullname)
    }

    pub fn save_with_rollback<T: ThingData>(
        &self,
        thing: &mut T,
        saved: bool,
    ) -> Result<(), ApiError> {
        self.pipeline.require_user()?;
        let previous = thing.base_mut().apply_saved(saved);
        let fullname = thing.fullname();
        let result = if saved {
            self.save(&fullname)
        } else {
            self.unsave(&fullname)
        };
        if result.is_err() {
            thing.base_mut().apply_saved(previous);
        }
        result
    }

    pub fn hide(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/hide", fullname)
    }

    pub fn unhide(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/unhide", fullname)
    }

    /// Posts a reply. The returned comment is unattached; place it with
    /// [`CommentTree::attach_reply`].
    pub fn reply(&self, parent_fullname: &str, text: &str) -> Result<Comment, ApiError> {
        let req = ApiRequest::post("api/comment")
            .form("api_type", "json")
            .form("parent", parent_fullname)
            .form("text", text)
            .requires_user();
        let mut comment = self.single_comment(&req)?;
        comment.depth = crate::listing::UNATTACHED_DEPTH;
        Ok(comment)
    }

    pub fn edit(&self, fullname: &str, text: &str) -> Result<Comment, ApiError> {
        let req = ApiRequest::post("api/editusertext")
            .form("api_type", "json")
            .form("thing_id", fullname)
            .form("text", text)
            .requires_user();
        self.single_comment(&req)
    }

    pub fn delete(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/del", fullname)
    }

    pub fn subscribe(&self, subreddit: &str, subscribe: bool) -> Result<(), ApiError> {
        let req = ApiRequest::post("api/subscribe")
            .form("action", if subscribe { "sub" } else { "unsub" })
            .form("sr_name", subreddit_name(subreddit))
            .requires_user();
        self.pipeline.execute_empty(&req)?;
        info!(
            "reddit: {} r/{}",
            if subscribe { "subscribed to" } else { "unsubscribed from" },
            subreddit_name(subreddit)
        );
        Ok(())
    }

    pub fn distinguish(
        &self,
        fullname: &str,
        how: Distinguish,
        sticky: bool,
    ) -> Result<(), ApiError> {
        let mut req = ApiRequest::post("api/distinguish")
            .form("api_type", "json")
            .form("id", fullname)
            .form("how", how.as_str())
            .requires_user();
        if sticky {
            req = req.form("sticky", "true");
        }
        let value: Value = self.pipeline.execute_json(&req)?;
        json_body(value)?;
        Ok(())
    }

    /// Pins or unpins a post. Pinning an already pinned post answers 409,
    /// which counts as success.
    pub fn sticky(&self, fullname: &str, state: bool) -> Result<(), ApiError> {
        let req = ApiRequest::post("api/set_subreddit_sticky")
            .form("api_type", "json")
            .form("id", fullname)
            .form("state", state)
            .requires_user();
        match self.pipeline.execute_empty(&req) {
            Err(err) if err.is_conflict() => {
                debug!("reddit: {fullname} already stickied");
                Ok(())
            }
            other => other,
        }
    }

    pub fn lock(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/lock", fullname)
    }

    pub fn unlock(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/unlock", fullname)
    }

    pub fn approve(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/approve", fullname)
    }

    pub fn remove(&self, fullname: &str, spam: bool) -> Result<(), ApiError> {
        let req = ApiRequest::post("api/remove")
            .form("id", fullname)
            .form("spam", spam)
            .requires_user();
        self.pipeline.execute_empty(&req)
    }

    pub fn mark_nsfw(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/marknsfw", fullname)
    }

    pub fn unmark_nsfw(&self, fullname: &str) -> Result<(), ApiError> {
        self.simple_action("api/unmarknsfw", fullname)
    }

    fn simple_action(&self, path: &str, fullname: &str) -> Result<(), ApiError> {
        let req = ApiRequest::post(path).form("id", fullname).requires_user();
        self.pipeline.execute_empty(&req)
    }

    fn single_comment(&self, req: &ApiRequest) -> Result<Comment, ApiError> {
        let value: Value = self.pipeline.execute_json(req)?;
        let body = json_body(value)?;
        let first = body
            .data
            .and_then(|data| data.things.into_iter().next())
            .ok_or_else(|| ApiError::Decode("response carries no comment".into()))?;
        let thing: Thing<Comment> = serde_json::from_value(first)?;
        Ok(thing.data)
    }

    fn post_listing(
        &self,
        path: String,
        sort: SortType,
        time: TimeFilter,
        page: &Page,
    ) -> Result<Listing<Post>, ApiError> {
        let mut req = page.apply(listing_request(path));
        if sort.takes_time() {
            req = req.query("t", time.as_str());
        }
        self.fetch_things(&req)
    }

    fn fetch_things<T>(&self, req: &ApiRequest) -> Result<Listing<T>, ApiError>
    where
        T: DeserializeOwned,
    {
        let envelope: ListingEnvelope<Thing<T>> = self.pipeline.execute_json(req)?;
        Ok(envelope.data.map(|thing| thing.data))
    }

    /// Fills in the parent post of gallery crossposts that arrived without
    /// their media, so `Post::gallery_images` can read it.
    fn expand_galleries(&self, things: &mut [AnyThing]) -> Result<(), ApiError> {
        let wanted: Vec<String> = things
            .iter()
            .filter_map(|thing| match thing {
                AnyThing::Post(post) if post.needs_gallery_expansion() => {
                    post.crosspost_parent.clone()
                }
                _ => None,
            })
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        debug!("reddit: expanding {} gallery crossposts", wanted.len());
        let parents: HashMap<String, Post> = self
            .by_id(&wanted)?
            .children
            .into_iter()
            .map(|post| (post.fullname(), post))
            .collect();
        for thing in things.iter_mut() {
            if let AnyThing::Post(post) = thing {
                let parent = post
                    .crosspost_parent
                    .as_ref()
                    .and_then(|name| parents.get(name));
                if let (true, Some(parent)) = (post.needs_gallery_expansion(), parent) {
                    post.crosspost_parent_list = vec![parent.clone()];
                }
            }
        }
        Ok(())
    }
}

fn listing_request(path: impl Into<String>) -> ApiRequest {
    ApiRequest::get(path).query("raw_json", 1)
}

fn subreddit_name(subreddit: &str) -> &str {
    subreddit
        .trim()
        .trim_start_matches('/')
        .trim_start_matches("r/")
        .trim_end_matches('/')
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    json: JsonBody,
}

#[derive(Debug, Deserialize)]
struct JsonBody {
    #[serde(default)]
    errors: Vec<Value>,
    #[serde(default)]
    data: Option<ThingsData>,
}

#[derive(Debug, Deserialize)]
struct ThingsData {
    #[serde(default)]
    things: Vec<Value>,
}

/// Unwraps an `api_type=json` response, turning `json.errors` into
/// [`ApiError::Listing`].
fn json_body(value: Value) -> Result<JsonBody, ApiError> {
    let envelope: JsonEnvelope = serde_json::from_value(value)?;
    if !envelope.json.errors.is_empty() {
        return Err(ApiError::Listing(field_errors_from(&envelope.json.errors)));
    }
    Ok(envelope.json)
}
