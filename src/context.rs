//! Keeps the prompt from growing with every page the agent visits.
//!
//! Only the newest observation is sent in full; older ones are swapped for a
//! short placeholder. The stored transcript is never touched.

use crate::types::Message;

pub const OBSERVATION_PLACEHOLDER: &str = "HTML content skipped for brevity.";

/// Copy of `transcript` in which every observation except the last one has
/// its body replaced by [`OBSERVATION_PLACEHOLDER`].
pub fn prune_observations(transcript: &[Message]) -> Vec<Message> {
    let latest = transcript.iter().rposition(Message::is_observation);

    transcript
        .iter()
        .enumerate()
        .map(|(index, message)| {
            if message.is_observation() && Some(index) != latest {
                Message {
                    content: OBSERVATION_PLACEHOLDER.to_string(),
                    ..message.clone()
                }
            } else {
                message.clone()
            }
        })
        .collect()
}
