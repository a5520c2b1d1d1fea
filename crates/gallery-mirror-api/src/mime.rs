//! Content types for asset and binary streams, served with each asset's
//! declared content type. Neither the marketplace nor the update
//! feed sends a `Content-Type` header upstream; both are inferred here.

use gallery_mirror_types::asset_type as wire;

pub fn content_type_for_asset(asset_type: &str) -> &'static str {
    match asset_type {
        t if t == wire::PACKAGE => "application/vsix",
        t if t == wire::MANIFEST => "application/json",
        t if t == wire::ICON => "image/png",
        t if t == wire::README => "text/markdown",
        t if t == wire::CHANGELOG => "text/markdown",
        t if t == wire::LICENSE => "text/plain",
        t if t == wire::TRANSLATIONS => "application/json",
        _ => "application/octet-stream",
    }
}

pub fn content_type_for_binary(filename: &str) -> &'static str {
    if filename.ends_with(".zip") {
        "application/zip"
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        "application/gzip"
    } else if filename.ends_with(".deb") {
        "application/vnd.debian.binary-package"
    } else if filename.ends_with(".rpm") {
        "application/x-rpm"
    } else {
        "application/octet-stream"
    }
}
