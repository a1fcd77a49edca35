//! Dependency installation strategies
//!
//! 플랫폼마다 바이너리 패키지 가용성이 달라서 한 번의 설치 명령으로는 부족하다.
//! 비용이 싼 순서대로 시도한다:
//! 1. 잠긴(compiled) 매니페스트
//! 2. 번들된 prebuilt wheel 디렉토리 (있을 때만)
//! 3. 패키지별 수동 설치 (플랫폼별 인덱스 URL)

use std::path::{Path, PathBuf};

const TORCH_PACKAGES: [&str; 3] = ["torch", "torchvision", "torchaudio"];
const TORCH_INDEX_CUDA: &str = "https://download.pytorch.org/whl/cu121";
const TORCH_INDEX_CPU: &str = "https://download.pytorch.org/whl/cpu";
const TORCH_INDEX_NIGHTLY_CPU: &str = "https://download.pytorch.org/whl/nightly/cpu";

/// Layout of the bundled resources directory.
///
/// ```text
/// <resources>/
///   uv/{win,linux,macos}/uv[.exe]
///   requirements/<platform>.compiled
///   wheels/
///   app/requirements.txt
///   app/custom_nodes/manager/requirements.txt
/// ```
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    pub root: PathBuf,
}

impl ResourcePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn compiled_manifest(&self, platform: &str) -> PathBuf {
        self.root
            .join("requirements")
            .join(format!("{}.compiled", platform))
    }

    pub fn wheel_dir(&self) -> PathBuf {
        self.root.join("wheels")
    }

    pub fn app_dir(&self) -> PathBuf {
        self.root.join("app")
    }

    pub fn app_requirements(&self) -> PathBuf {
        self.app_dir().join("requirements.txt")
    }

    pub fn manager_requirements(&self) -> PathBuf {
        self.app_dir()
            .join("custom_nodes")
            .join("manager")
            .join("requirements.txt")
    }
}

/// One `uv pip install` invocation inside a per-package strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageStep {
    /// Named packages, optionally from a specific index
    Packages {
        packages: Vec<String>,
        index_url: Option<String>,
        extra_index_url: Option<String>,
        prerelease: bool,
    },
    /// A plain requirements file
    Requirements(PathBuf),
}

impl PackageStep {
    fn pip_args(&self) -> Vec<String> {
        let mut args = vec!["pip".to_string(), "install".to_string()];
        match self {
            PackageStep::Packages {
                packages,
                index_url,
                extra_index_url,
                prerelease,
            } => {
                if *prerelease {
                    args.extend(["-U", "--prerelease", "allow"].map(String::from));
                }
                args.extend(packages.iter().cloned());
                if let Some(url) = index_url {
                    args.extend(["--index-url".to_string(), url.clone()]);
                }
                if let Some(url) = extra_index_url {
                    args.extend(["--extra-index-url".to_string(), url.clone()]);
                }
            }
            PackageStep::Requirements(path) => {
                args.extend(["-r".to_string(), path.to_string_lossy().into_owned()]);
            }
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStrategy {
    LockedManifest { manifest: PathBuf },
    PrebuiltPackages { wheel_dir: PathBuf, manifest: PathBuf },
    PerPackage { steps: Vec<PackageStep> },
}

impl InstallStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            InstallStrategy::LockedManifest { .. } => "locked-manifest",
            InstallStrategy::PrebuiltPackages { .. } => "prebuilt-packages",
            InstallStrategy::PerPackage { .. } => "per-package",
        }
    }

    /// Prebuilt packages are only tried when the wheel directory is bundled.
    pub fn is_available(&self) -> bool {
        match self {
            InstallStrategy::PrebuiltPackages { wheel_dir, .. } => wheel_dir.is_dir(),
            _ => true,
        }
    }

    /// Command lines to run, in order. All must exit zero for the strategy to succeed.
    pub fn commands(&self, uv: &Path) -> Vec<String> {
        let arg_sets: Vec<Vec<String>> = match self {
            InstallStrategy::LockedManifest { manifest } => vec![vec![
                "pip".into(),
                "install".into(),
                "-r".into(),
                manifest.to_string_lossy().into_owned(),
                "--index-strategy".into(),
                "unsafe-best-match".into(),
            ]],
            InstallStrategy::PrebuiltPackages { wheel_dir, manifest } => vec![vec![
                "pip".into(),
                "install".into(),
                "--no-index".into(),
                "--find-links".into(),
                wheel_dir.to_string_lossy().into_owned(),
                "-r".into(),
                manifest.to_string_lossy().into_owned(),
            ]],
            InstallStrategy::PerPackage { steps } => steps.iter().map(PackageStep::pip_args).collect(),
        };
        arg_sets
            .iter()
            .map(|args| shell_command(&uv.to_string_lossy(), args))
            .collect()
    }
}

/// Ordered strategies; the first one that exits zero wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySpec {
    strategies: Vec<InstallStrategy>,
}

impl DependencySpec {
    pub fn new(strategies: Vec<InstallStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[InstallStrategy] {
        &self.strategies
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategies for the OS this process runs on.
    pub fn for_host(resources: &ResourcePaths) -> Self {
        Self::for_os(std::env::consts::OS, resources)
    }

    /// Pure selection by OS name (`std::env::consts::OS` values).
    pub fn for_os(os: &str, resources: &ResourcePaths) -> Self {
        let manual = |torch: PackageStep| InstallStrategy::PerPackage {
            steps: vec![
                torch,
                PackageStep::Requirements(resources.app_requirements()),
                PackageStep::Requirements(resources.manager_requirements()),
            ],
        };
        let torch = |index_url: Option<&str>, extra_index_url: Option<&str>, prerelease: bool| {
            PackageStep::Packages {
                packages: TORCH_PACKAGES.iter().map(|p| p.to_string()).collect(),
                index_url: index_url.map(String::from),
                extra_index_url: extra_index_url.map(String::from),
                prerelease,
            }
        };

        let strategies = match os {
            "windows" => {
                let locked = resources.compiled_manifest("windows_nvidia");
                vec![
                    InstallStrategy::LockedManifest { manifest: locked.clone() },
                    InstallStrategy::PrebuiltPackages {
                        wheel_dir: resources.wheel_dir(),
                        manifest: locked,
                    },
                    manual(torch(Some(TORCH_INDEX_CUDA), None, false)),
                ]
            }
            // macOS has no usable locked manifest; MPS builds come from nightly.
            "macos" => vec![
                InstallStrategy::PrebuiltPackages {
                    wheel_dir: resources.wheel_dir(),
                    manifest: resources.app_requirements(),
                },
                manual(torch(None, Some(TORCH_INDEX_NIGHTLY_CPU), true)),
            ],
            _ => {
                let locked = resources.compiled_manifest("linux");
                vec![
                    InstallStrategy::LockedManifest { manifest: locked.clone() },
                    InstallStrategy::PrebuiltPackages {
                        wheel_dir: resources.wheel_dir(),
                        manifest: locked,
                    },
                    manual(torch(Some(TORCH_INDEX_CPU), None, false)),
                ]
            }
        };
        Self { strategies }
    }
}

/// Quote a program and its arguments for the host shell.
/// PowerShell needs the call operator to run a quoted path.
pub fn shell_command(program: &str, args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| format!("\"{}\"", a)).collect();
    let call = if cfg!(target_os = "windows") { "& " } else { "" };
    if quoted.is_empty() {
        format!("{}\"{}\"", call, program)
    } else {
        format!("{}\"{}\" {}", call, program, quoted.join(" "))
    }
}
