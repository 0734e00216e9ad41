/// REGISTER Contact 中携带的 feature tag
use crate::config::CapabilityConfig;

pub const FEATURE_OMA_IM: &str = "+g.oma.sip-im";
pub const FEATURE_3GPP_VIDEO_SHARE: &str = "+g.3gpp.cs-voice";
pub const FEATURE_RCS_IP_VOICE_CALL: &str = "+g.gsma.rcs.ipcall";
pub const FEATURE_IP_VIDEO_CALL: &str = "video";
pub const FEATURE_SIP_AUTOMATA: &str = "automata";
pub const FEATURE_3GPP_ICSI_REF: &str = "+g.3gpp.icsi-ref";
pub const FEATURE_3GPP_IARI_REF: &str = "+g.3gpp.iari-ref";

pub const ICSI_MMTEL: &str = "urn%3Aurn-7%3A3gpp-service.ims.icsi.mmtel";
pub const IARI_IMAGE_SHARE: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.gsma-is";
pub const IARI_GEOLOC_PUSH: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.geopush";
pub const IARI_FT_HTTP: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.fthttp";
pub const IARI_EXTENSION_PREFIX: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.ext.";

/// 有序的 feature tag 集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTagSet {
    tags: Vec<String>,
}

impl FeatureTagSet {
    /// 由能力配置计算，ICSI 和 IARI 分别合并成一个参数
    pub fn from_config(capabilities: &CapabilityConfig) -> Self {
        let mut tags = Vec::new();
        let mut icsi = Vec::new();
        let mut iari = Vec::new();

        if capabilities.im_session {
            tags.push(FEATURE_OMA_IM.to_string());
        }
        if capabilities.video_share {
            tags.push(FEATURE_3GPP_VIDEO_SHARE.to_string());
        }
        if capabilities.ip_voice_call {
            icsi.push(ICSI_MMTEL.to_string());
            tags.push(FEATURE_RCS_IP_VOICE_CALL.to_string());
        }
        if capabilities.ip_video_call {
            tags.push(FEATURE_IP_VIDEO_CALL.to_string());
        }
        if capabilities.image_share {
            iari.push(IARI_IMAGE_SHARE.to_string());
        }
        if capabilities.geoloc_push {
            iari.push(IARI_GEOLOC_PUSH.to_string());
        }
        if capabilities.file_transfer_http {
            iari.push(IARI_FT_HTTP.to_string());
        }
        for ext in capabilities.extensions.iter().filter(|e| !e.trim().is_empty()) {
            iari.push(format!("{}{}", IARI_EXTENSION_PREFIX, ext.trim()));
        }

        if !icsi.is_empty() {
            tags.push(format!("{}=\"{}\"", FEATURE_3GPP_ICSI_REF, icsi.join(",")));
        }
        if !iari.is_empty() {
            tags.push(format!("{}=\"{}\"", FEATURE_3GPP_IARI_REF, iari.join(",")));
        }
        if capabilities.automata {
            tags.push(FEATURE_SIP_AUTOMATA.to_string());
        }

        Self { tags }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
