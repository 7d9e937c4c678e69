// Chat message texts. Uses Slack markup: `<!everyone>` pings the channel,
// `<@U123>` mentions a user and `:name:` renders an emoji.

use crate::model::{DeliveryType, PollStatus, Venue};

/// The proposal participants react to.
pub fn proposal(venue: &Venue, join: &[String], decline: &[String]) -> String {
    let mut text = format!(
        "<!everyone> How about :{}: *{}* today?",
        venue.emoji, venue.name
    );
    if let Some(j) = join.first() {
        text.push_str(&format!("\nReact :{j}: to join"));
        if let Some(d) = decline.first() {
            text.push_str(&format!(", :{d}: if you're eating at home"));
        }
        text.push('.');
    }
    text
}

/// Announcement for a confirmed session. `payer` is a chat user id.
pub fn confirmed(venue: &Venue, payer: Option<&str>, reminder: bool) -> String {
    let prefix = if reminder { "Reminder: " } else { "" };
    let mut text = format!("<!everyone> {prefix}We're eating {}!", venue.name);
    if !venue.instructions.is_empty() {
        text.push(' ');
        text.push_str(&venue.instructions);
    }
    if let Some(payer) = payer {
        match venue.delivery {
            DeliveryType::Bike => {
                text.push_str(&format!("\n<@{payer}> has the honour to :bike: today"));
            }
            DeliveryType::Delivery => {
                text.push_str(&format!(
                    "\n<@{payer}> has the honour to pay for this :money_with_wings:"
                ));
            }
            DeliveryType::EatingOut => {}
        }
    }
    text
}

pub fn rejected(venue: &Venue) -> String {
    format!("No {} today, the group passed. :cry:", venue.name)
}

pub fn expired() -> String {
    "Nobody responded. No dinner together this week? :(".to_string()
}

/// Text announcing the terminal `status` of a session.
pub fn outcome(status: PollStatus, venue: &Venue, payer: Option<&str>) -> Option<String> {
    match status {
        PollStatus::Open => None,
        PollStatus::Confirmed => Some(confirmed(venue, payer, false)),
        PollStatus::Rejected => Some(rejected(venue)),
        PollStatus::Expired => Some(expired()),
    }
}
