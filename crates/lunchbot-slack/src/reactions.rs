// Turning Slack reaction lists into per-participant votes.
//
// `reactions.get` returns, per reaction name, the users holding it. A user
// may hold several; the strongest vote wins (veto > decline > join).

use std::collections::BTreeMap;

use lunchbot_core::config::ReactionConfig;
use lunchbot_core::model::{ParticipantId, ReactionEvent, Vote};
use serde::Deserialize;

/// One entry of `message.reactions` in a `reactions.get` response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
}

/// Skin-tone variants (`+1::skin-tone-3`) count as the base reaction.
fn base_name(name: &str) -> &str {
    name.split("::").next().unwrap_or(name)
}

/// Current vote of every participant, ignoring `ignore_user` (the bot's own
/// prompt reactions) and reactions that express no vote.
pub fn votes_from_reactions(
    reactions: &[ReactionSummary],
    config: &ReactionConfig,
    ignore_user: Option<&str>,
) -> BTreeMap<ParticipantId, Vote> {
    let mut votes: BTreeMap<ParticipantId, Vote> = BTreeMap::new();
    for reaction in reactions {
        let Some(vote) = config.vote_for(base_name(&reaction.name)) else {
            continue;
        };
        for user in &reaction.users {
            if Some(user.as_str()) == ignore_user {
                continue;
            }
            votes
                .entry(user.clone())
                .and_modify(|current| {
                    if vote.precedence() > current.precedence() {
                        *current = vote;
                    }
                })
                .or_insert(vote);
        }
    }
    votes
}

/// Events that take `before` to `after`: a cast for every new or changed
/// vote, a withdrawal for every vote that disappeared.
pub fn diff(
    before: &BTreeMap<ParticipantId, Vote>,
    after: &BTreeMap<ParticipantId, Vote>,
) -> Vec<ReactionEvent> {
    let mut events = Vec::new();
    for (participant, vote) in after {
        if before.get(participant) != Some(vote) {
            events.push(ReactionEvent::Cast {
                participant: participant.clone(),
                vote: *vote,
            });
        }
    }
    for participant in before.keys() {
        if !after.contains_key(participant) {
            events.push(ReactionEvent::Withdrawn {
                participant: participant.clone(),
            });
        }
    }
    events
}
