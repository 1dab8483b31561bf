//! The static plugin registry. Plugins are compiled in and declared here;
//! the configured plugin directories only contribute their on-disk assets.

use crate::{build, chroot, fetch, installer, publish, sign, source, template, upload};
use crate::PluginFactory;

static FETCH: fetch::FetchPlugin = fetch::FetchPlugin;
static SOURCE_RPM: source::rpm::RpmSourcePlugin = source::rpm::RpmSourcePlugin;
static SOURCE_DEB: source::deb::DebSourcePlugin = source::deb::DebSourcePlugin;
static SOURCE_ARCHLINUX: source::archlinux::ArchlinuxSourcePlugin =
    source::archlinux::ArchlinuxSourcePlugin;
static SOURCE_WINDOWS: source::windows::WindowsSourcePlugin = source::windows::WindowsSourcePlugin;
static BUILD_RPM: build::rpm::RpmBuildPlugin = build::rpm::RpmBuildPlugin;
static BUILD_DEB: build::deb::DebBuildPlugin = build::deb::DebBuildPlugin;
static BUILD_ARCHLINUX: build::archlinux::ArchlinuxBuildPlugin =
    build::archlinux::ArchlinuxBuildPlugin;
static BUILD_WINDOWS: build::windows::WindowsBuildPlugin = build::windows::WindowsBuildPlugin;
static CHROOT_RPM: chroot::rpm::RpmChrootPlugin = chroot::rpm::RpmChrootPlugin;
static CHROOT_DEB: chroot::deb::DebChrootPlugin = chroot::deb::DebChrootPlugin;
static CHROOT_ARCHLINUX: chroot::archlinux::ArchlinuxChrootPlugin =
    chroot::archlinux::ArchlinuxChrootPlugin;
static SIGN_RPM: sign::rpm::RpmSignPlugin = sign::rpm::RpmSignPlugin;
static SIGN_DEB: sign::deb::DebSignPlugin = sign::deb::DebSignPlugin;
static SIGN_ARCHLINUX: sign::archlinux::ArchlinuxSignPlugin = sign::archlinux::ArchlinuxSignPlugin;
static PUBLISH_RPM: publish::rpm::RpmPublishPlugin = publish::rpm::RpmPublishPlugin;
static PUBLISH_DEB: publish::deb::DebPublishPlugin = publish::deb::DebPublishPlugin;
static PUBLISH_ARCHLINUX: publish::archlinux::ArchlinuxPublishPlugin =
    publish::archlinux::ArchlinuxPublishPlugin;
static UPLOAD: upload::UploadPlugin = upload::UploadPlugin;
static TEMPLATE: template::TemplateBuilderPlugin = template::TemplateBuilderPlugin;
static INSTALLER: installer::InstallerPlugin = installer::InstallerPlugin;

static BUILTIN_PLUGINS: [&dyn PluginFactory; 21] = [
    &FETCH,
    &SOURCE_RPM,
    &SOURCE_DEB,
    &SOURCE_ARCHLINUX,
    &SOURCE_WINDOWS,
    &BUILD_RPM,
    &BUILD_DEB,
    &BUILD_ARCHLINUX,
    &BUILD_WINDOWS,
    &CHROOT_RPM,
    &CHROOT_DEB,
    &CHROOT_ARCHLINUX,
    &SIGN_RPM,
    &SIGN_DEB,
    &SIGN_ARCHLINUX,
    &PUBLISH_RPM,
    &PUBLISH_DEB,
    &PUBLISH_ARCHLINUX,
    &UPLOAD,
    &TEMPLATE,
    &INSTALLER,
];

/// Abstract plugin names the concrete ones build on; they exist as asset
/// directories rather than runnable plugins.
const BASE_PLUGINS: [&str; 5] = ["source", "build", "chroot", "sign", "publish"];

pub fn builtin_plugins() -> &'static [&'static dyn PluginFactory] {
    &BUILTIN_PLUGINS
}

pub fn is_builtin(name: &str) -> bool {
    BASE_PLUGINS.contains(&name) || BUILTIN_PLUGINS.iter().any(|plugin| plugin.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn plugin_names_are_globally_unique() {
        let names: HashSet<&str> = builtin_plugins().iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), builtin_plugins().len());
    }

    #[test]
    fn knows_builtins_and_bases() {
        assert!(is_builtin("fetch"));
        assert!(is_builtin("build_rpm"));
        assert!(is_builtin("sign"));
        assert!(!is_builtin("no_such_plugin"));
    }
}
