// QoS profile selection.
//
// Each topic carries two profiles: one for the sample endpoint, one for the
// stream-type endpoint. Profiles are chosen by the declared byte size of the
// stream type; types that exceed the transport message limit switch to the
// `_big` variant of their meta-type profile.

use std::collections::HashSet;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::const_assert;

use super::stream_type::{
  StreamType, META_TYPE_PLAIN, META_TYPE_PLAIN_ARRAY, META_TYPE_RAW, META_TYPE_STRING,
  META_TYPE_STRUCTURED,
};

/// Largest message the transport layer moves without the big-data machinery.
pub const TRANSPORT_LAYER_MAX_MESSAGE_SIZE: usize = 63_000;
// The limit must stay below the 16-bit datagram ceiling the profiles assume.
const_assert!(TRANSPORT_LAYER_MAX_MESSAGE_SIZE < 65_536);

pub const QOS_PROFILE_PREFIX: &str = "simrt::";
pub const BIG_QOS_PROFILE_POSTFIX: &str = "_big";
pub const DEFAULT_QOS_PROFILE: &str = "simrt::default_profile";
pub const STREAM_TYPE_QOS_PROFILE: &str = "simrt::stream_type";

/// The set of profile names known to the transport configuration.
pub struct QosProfileStore {
  profiles: HashSet<String>,
}

impl QosProfileStore {
  /// The built-in profile library.
  pub fn new() -> Self {
    let mut profiles = HashSet::new();
    for meta_type in [
      META_TYPE_RAW,
      META_TYPE_PLAIN,
      META_TYPE_PLAIN_ARRAY,
      META_TYPE_STRING,
      META_TYPE_STRUCTURED,
    ] {
      profiles.insert(meta_type.to_string());
      profiles.insert(format!("{meta_type}{BIG_QOS_PROFILE_POSTFIX}"));
    }
    profiles.insert("stream_type".to_string());
    profiles.insert(format!("stream_type{BIG_QOS_PROFILE_POSTFIX}"));
    profiles.insert("default_profile".to_string());
    QosProfileStore {
      profiles,
    }
  }

  pub fn contains_profile(&self, profile: &str) -> bool {
    self.profiles.contains(profile)
  }

  /// Whether the declared sample size of `stream_type` crosses the transport
  /// limit. Types with unknown size never count as big.
  pub fn is_big(stream_type: &StreamType) -> bool {
    stream_type
      .sample_size()
      .map(|size| size >= TRANSPORT_LAYER_MAX_MESSAGE_SIZE)
      .unwrap_or(false)
  }

  /// Profile for the sample endpoint of a topic.
  ///
  /// Big types use `<meta_type>_big` when that profile exists; unknown
  /// meta types fall back to the default profile (the caller warns once per
  /// topic).
  pub fn find_sample_profile(&self, stream_type: &StreamType, topic_name: &str) -> QosSelection {
    let meta_type = stream_type.meta_type();

    if Self::is_big(stream_type) {
      let big_profile = format!("{meta_type}{BIG_QOS_PROFILE_POSTFIX}");
      if self.contains_profile(&big_profile) {
        debug!(
          "size of sample described by stream type '{meta_type}' for topic '{topic_name}' \
           exceeds max transport limit of {TRANSPORT_LAYER_MAX_MESSAGE_SIZE}, qos profile \
           '{QOS_PROFILE_PREFIX}{big_profile}' will be used"
        );
        return QosSelection::known(&format!("{QOS_PROFILE_PREFIX}{big_profile}"));
      }
    }

    if self.contains_profile(meta_type) {
      QosSelection::known(&format!("{QOS_PROFILE_PREFIX}{meta_type}"))
    } else {
      QosSelection::fallback()
    }
  }

  /// Profile for the stream-type endpoint; depends on the size of the
  /// stream-type message itself.
  pub fn find_stream_type_profile(&self, stream_type: &StreamType, topic_name: &str) -> String {
    if stream_type.stream_type_size() >= TRANSPORT_LAYER_MAX_MESSAGE_SIZE {
      debug!(
        "content of stream type '{}' of topic '{topic_name}' exceeds max transport limit of \
         {TRANSPORT_LAYER_MAX_MESSAGE_SIZE}, qos profile \
         '{STREAM_TYPE_QOS_PROFILE}{BIG_QOS_PROFILE_POSTFIX}' will be used",
        stream_type.meta_type()
      );
      format!("{STREAM_TYPE_QOS_PROFILE}{BIG_QOS_PROFILE_POSTFIX}")
    } else {
      STREAM_TYPE_QOS_PROFILE.to_string()
    }
  }
}

impl Default for QosProfileStore {
  fn default() -> Self {
    Self::new()
  }
}

/// Outcome of a sample profile lookup. Fallback selections are reported once
/// per topic by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosSelection {
  pub profile: String,
  pub is_fallback: bool,
}

impl QosSelection {
  fn known(profile: &str) -> Self {
    QosSelection {
      profile: profile.to_string(),
      is_fallback: false,
    }
  }

  fn fallback() -> Self {
    QosSelection {
      profile: DEFAULT_QOS_PROFILE.to_string(),
      is_fallback: true,
    }
  }
}
