use std::path::{Path, PathBuf};

/// The persisted `artifacts/` tree.
///
/// ```text
/// artifacts/
///   sources/<component>/                  git checkouts
///   distfiles/<component>/<file>          verified upstream archives
///   components/<component>/<ver>/<dist|nodist>/<stage>/
///   templates/
///   repository/<distribution>/            builder-local repos
///   repository-publish/<family>/<release>/<repo>/
///   logs/
///   cache/chroot/<dist>/
/// ```
#[derive(Clone, Debug)]
pub struct ArtifactsLayout {
    root: PathBuf,
}

impl ArtifactsLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn source_dir(&self, component: &str) -> PathBuf {
        self.sources_dir().join(component)
    }

    pub fn distfiles_dir(&self) -> PathBuf {
        self.root.join("distfiles")
    }

    pub fn component_distfiles_dir(&self, component: &str) -> PathBuf {
        self.distfiles_dir().join(component)
    }

    /// Per-component, per-distribution stage directory.
    pub fn dist_artifacts_dir(
        &self,
        component: &str,
        verrel: &str,
        distribution: &str,
        stage: &str,
    ) -> PathBuf {
        self.root
            .join("components")
            .join(component)
            .join(verrel)
            .join(distribution)
            .join(stage)
    }

    /// Per-component stage directory for distribution-independent artifacts.
    pub fn component_artifacts_dir(&self, component: &str, verrel: &str, stage: &str) -> PathBuf {
        self.dist_artifacts_dir(component, verrel, "nodist", stage)
    }

    /// The devel counter lives outside any version directory.
    pub fn devel_path(&self, component: &str) -> PathBuf {
        self.root
            .join("components")
            .join(component)
            .join("noversion")
            .join("devel")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn template_timestamp_path(&self, template: &str) -> PathBuf {
        self.templates_dir().join(format!("build_timestamp_{template}"))
    }

    /// Builder-local repository seeded with this pipeline's own outputs.
    pub fn repository_dir(&self, distribution: &str) -> PathBuf {
        self.root.join("repository").join(distribution)
    }

    /// Externally visible, hardlink-only publish tree.
    pub fn repository_publish_dir(&self, family: &str) -> PathBuf {
        self.root.join("repository-publish").join(family)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn chroot_cache_dir(&self, distribution_name: &str) -> PathBuf {
        self.cache_dir().join("chroot").join(distribution_name)
    }

    pub fn installer_dir(&self) -> PathBuf {
        self.root.join("installer")
    }

    pub fn iso_dir(&self) -> PathBuf {
        self.root.join("iso")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn component_paths() {
        let layout = ArtifactsLayout::new(Path::new("/work/artifacts"));
        assert_eq!(
            layout.dist_artifacts_dir("core-qrexec", "4.1.16-1", "host-fc32", "publish"),
            Path::new("/work/artifacts/components/core-qrexec/4.1.16-1/host-fc32/publish")
        );
        assert_eq!(
            layout.component_artifacts_dir("core-qrexec", "4.1.16-1", "fetch"),
            Path::new("/work/artifacts/components/core-qrexec/4.1.16-1/nodist/fetch")
        );
        assert_eq!(
            layout.template_timestamp_path("fedora-35-xfce"),
            Path::new("/work/artifacts/templates/build_timestamp_fedora-35-xfce")
        );
    }
}
