use ash::extensions::ext;
use ash::vk;
use std::borrow::Cow;
use std::ffi::{CStr, CString};

/// Validation messenger plus object naming, present only when validation is enabled.
pub(crate) struct DebugUtils {
    pub(crate) loader: ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Severities worth forwarding at the current `log` level.
fn messenger_severities(level: log::LevelFilter) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
    let mut severities = Severity::ERROR | Severity::WARNING;
    if level >= log::LevelFilter::Debug {
        severities |= Severity::INFO;
    }
    if level >= log::LevelFilter::Trace {
        severities |= Severity::VERBOSE;
    }
    severities
}

fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
    if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else if severity.contains(Severity::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

impl DebugUtils {
    pub(crate) fn name() -> &'static CStr {
        ext::DebugUtils::name()
    }

    pub(crate) fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> ash::prelude::VkResult<Self> {
        let loader = ext::DebugUtils::new(entry, instance);
        let messenger = unsafe {
            loader.create_debug_utils_messenger(
                &vk::DebugUtilsMessengerCreateInfoEXT::builder()
                    .message_severity(messenger_severities(log::max_level()))
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(forward_to_log)),
                None,
            )?
        };
        debug!("Validation messenger created");

        Ok(Self { loader, messenger })
    }

    pub(crate) fn set_object_name<T: vk::Handle>(&self, device: vk::Device, object: T, name: &str) {
        let Ok(name) = CString::new(name) else {
            warn!("Debug name {:?} contains a nul byte", name);
            return;
        };

        let result = unsafe {
            self.loader.set_debug_utils_object_name(
                device,
                &vk::DebugUtilsObjectNameInfoEXT::builder()
                    .object_type(T::TYPE)
                    .object_handle(object.as_raw())
                    .object_name(&name),
            )
        };
        if let Err(error) = result {
            warn!("Naming {:?} {:?} failed: {}", T::TYPE, name, error);
        }
    }
}

impl Drop for DebugUtils {
    fn drop(&mut self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None)
        };
    }
}

unsafe extern "system" fn forward_to_log(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let message = match callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => CStr::from_ptr(data.p_message).to_string_lossy(),
        _ => Cow::from(""),
    };
    log!(log_level(severity), "[{:?}] {}", message_type, message);
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    #[test]
    fn quiet_levels_only_forward_problems() {
        assert_eq!(
            messenger_severities(log::LevelFilter::Warn),
            Severity::ERROR | Severity::WARNING
        );
        assert_eq!(
            messenger_severities(log::LevelFilter::Off),
            Severity::ERROR | Severity::WARNING
        );
        assert!(messenger_severities(log::LevelFilter::Debug).contains(Severity::INFO));
        assert!(!messenger_severities(log::LevelFilter::Debug).contains(Severity::VERBOSE));
        assert!(messenger_severities(log::LevelFilter::Trace).contains(Severity::VERBOSE));
    }

    #[test]
    fn severities_map_to_log_levels() {
        assert_eq!(log_level(Severity::ERROR), log::Level::Error);
        assert_eq!(log_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(log_level(Severity::INFO), log::Level::Debug);
        assert_eq!(log_level(Severity::VERBOSE), log::Level::Trace);
    }
}
