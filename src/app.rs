use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};

use crate::comments::{CommentNode, CommentTree};
use crate::config;
use crate::listing::Post;
use crate::reddit::{CommentSort, Page, SortType, TimeFilter};
use crate::session::Session;

/// How long a CLI command waits for its dispatched call.
const CALL_TIMEOUT: Duration = Duration::from_secs(120);

pub const USAGE: &str = "redlurk: browse Reddit from the command line.

Usage:
  redlurk login                         Authorize with a Reddit account in the browser
  redlurk logout                        Revoke and forget the stored credential
  redlurk whoami                        Show the logged-in account
  redlurk posts [subreddit]             List hot posts of the front page or a subreddit
  redlurk comments <subreddit> <id>     Show the comment tree of a post

  --version, -V                         Show version and exit
  --help,    -h                         Show this help message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login,
    Logout,
    Whoami,
    Posts { subreddit: Option<String> },
    Comments { subreddit: String, article: String },
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut args = args.iter().map(String::as_str);
        let command = match args.next() {
            Some("login") => Command::Login,
            Some("logout") => Command::Logout,
            Some("whoami") => Command::Whoami,
            Some("posts") => Command::Posts {
                subreddit: args.next().map(str::to_string),
            },
            Some("comments") => {
                let (Some(subreddit), Some(article)) = (args.next(), args.next()) else {
                    bail!("usage: redlurk comments <subreddit> <id>");
                };
                Command::Comments {
                    subreddit: subreddit.to_string(),
                    article: article.to_string(),
                }
            }
            Some(other) => bail!("unknown command {other:?}\n\n{USAGE}"),
            None => bail!("missing command\n\n{USAGE}"),
        };
        if let Some(extra) = args.next() {
            bail!("unexpected argument {extra:?}");
        }
        Ok(command)
    }
}

pub fn run(args: &[String]) -> Result<()> {
    let command = Command::parse(args)?;
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let session = Session::open(&cfg).with_context(|| {
        format!(
            "start session (config file: {})",
            friendly_path(config::default_path().as_ref())
        )
    })?;
    debug!("app: running {command:?}");

    match command {
        Command::Login => login(&session),
        Command::Logout => {
            session.logout()?;
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => {
            match session.whoami()? {
                Some(me) => println!("u/{} ({} karma)", me.name, me.link_karma + me.comment_karma),
                None => println!("Not logged in; browsing anonymously."),
            }
            Ok(())
        }
        Command::Posts { subreddit } => posts(&session, subreddit),
        Command::Comments { subreddit, article } => comments(&session, subreddit, article),
    }
}

fn login(session: &Session) -> Result<()> {
    let authz = session.begin_login()?;
    println!("Opening the browser to authorize redlurk:\n{}", authz.browser_url);
    if let Err(err) = webbrowser::open(&authz.browser_url) {
        warn!("app: could not open browser: {err}");
        println!("Open the URL above manually to continue.");
    }
    session.complete_login(authz)?;
    match session.whoami() {
        Ok(Some(me)) => println!("Logged in as u/{}.", me.name),
        Ok(None) | Err(_) => println!("Logged in."),
    }
    Ok(())
}

fn posts(session: &Session, subreddit: Option<String>) -> Result<()> {
    let client = session.client().clone();
    let rx = session.dispatcher().request(move || {
        let page = Page::first();
        match subreddit {
            Some(name) => client.subreddit_posts(&name, SortType::Hot, TimeFilter::Day, &page),
            None => client.front_page(SortType::Hot, TimeFilter::Day, &page),
        }
    });
    let listing = rx
        .recv_timeout(CALL_TIMEOUT)
        .map_err(|_| anyhow!("timed out waiting for posts"))??;
    for post in &listing.children {
        println!("{}", format_post(post));
    }
    Ok(())
}

fn comments(session: &Session, subreddit: String, article: String) -> Result<()> {
    let client = session.client().clone();
    let rx = session.dispatcher().request(move || {
        client.comments(&subreddit, &article, CommentSort::Confidence, None, None)
    });
    let thread = rx
        .recv_timeout(CALL_TIMEOUT)
        .map_err(|_| anyhow!("timed out waiting for comments"))??;
    let (post, tree) = thread.into_tree();
    println!("{}\n", format_post(&post));
    for line in render_tree(&tree) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_post(post: &Post) -> String {
    format!(
        "{:>6}  {}  (r/{}, {} comments)",
        post.base.score, post.title, post.subreddit, post.num_comments
    )
}

/// One line per visible node, indented by depth.
pub fn render_tree(tree: &CommentTree) -> Vec<String> {
    tree.iter_visible()
        .map(|node| {
            let indent = "  ".repeat(node.depth().max(0) as usize);
            match node.item() {
                CommentNode::Comment(comment) => {
                    let body = comment.body.lines().next().unwrap_or_default();
                    format!(
                        "{indent}[{}] u/{}: {body}",
                        comment.base.score, comment.base.author
                    )
                }
                CommentNode::More(more) if more.is_continue_thread() => {
                    format!("{indent}(continue this thread)")
                }
                CommentNode::More(more) => format!("{indent}({} more replies)", more.count),
            }
        })
        .collect()
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/redlurk/config.yaml".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::{Comment, ListingBase, MoreChildren};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse(&args(&["login"])).unwrap(), Command::Login);
        assert_eq!(
            Command::parse(&args(&["posts"])).unwrap(),
            Command::Posts { subreddit: None }
        );
        assert_eq!(
            Command::parse(&args(&["posts", "rust"])).unwrap(),
            Command::Posts {
                subreddit: Some("rust".into())
            }
        );
        assert_eq!(
            Command::parse(&args(&["comments", "rust", "abc123"])).unwrap(),
            Command::Comments {
                subreddit: "rust".into(),
                article: "abc123".into()
            }
        );
    }

    #[test]
    fn rejects_bad_invocations() {
        assert!(Command::parse(&args(&[])).is_err());
        assert!(Command::parse(&args(&["frobnicate"])).is_err());
        assert!(Command::parse(&args(&["comments", "rust"])).is_err());
        assert!(Command::parse(&args(&["whoami", "extra"])).is_err());
    }

    fn comment(id: &str, depth: i32, body: &str) -> CommentNode {
        CommentNode::from(Comment {
            base: ListingBase {
                id: id.into(),
                author: "ferris".into(),
                score: 3,
                ..ListingBase::default()
            },
            body: body.into(),
            depth,
            ..Comment::default()
        })
    }

    #[test]
    fn renders_visible_nodes_indented() {
        let tree = CommentTree::from_flat(vec![
            comment("a", 0, "top level\nsecond line"),
            comment("b", 1, "reply"),
            CommentNode::from(MoreChildren {
                id: "m".into(),
                parent_id: "t1_b".into(),
                depth: 2,
                count: 4,
                children: vec!["x".into()],
            }),
        ]);
        assert_eq!(
            render_tree(&tree),
            vec![
                "[3] u/ferris: top level".to_string(),
                "  [3] u/ferris: reply".to_string(),
                "    (4 more replies)".to_string(),
            ]
        );
    }
}
