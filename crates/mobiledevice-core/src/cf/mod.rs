//! CoreFoundation marshalling.
//!
//! The native library speaks CoreFoundation for strings, URLs and property
//! lists. Property lists cross the boundary as `plist::Value`, converted
//! through the binary plist encoding. Only macOS ships CoreFoundation; other
//! platforms get a stub whose constructors report `Unsupported`.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub(crate) use macos::*;

#[cfg(not(target_os = "macos"))]
mod unsupported;
#[cfg(not(target_os = "macos"))]
pub(crate) use unsupported::*;

/// Wrap a dictionary so it can go through [`property_list`].
pub(crate) fn dictionary(dict: &plist::Dictionary) -> crate::error::Result<OwnedCf> {
    property_list(&plist::Value::Dictionary(dict.clone()))
}

/// Like [`dictionary`], with `None` mapped to a null argument.
pub(crate) fn optional_dictionary(
    dict: Option<&plist::Dictionary>,
) -> crate::error::Result<Option<OwnedCf>> {
    dict.map(dictionary).transpose()
}
