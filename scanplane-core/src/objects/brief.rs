use scanplane_model::{ScanBrief, ScanStatus};

use super::{ObjectStatus, ScanInfo};

pub(super) fn fill_brief(info: &ScanInfo) -> ScanBrief {
    let mut brief = ScanBrief {
        cve_db_version: info.version.clone(),
        cve_db_create_time: info.cve_db_create_time.clone(),
        base_os: info.base_os.clone(),
        ..ScanBrief::default()
    };

    match info.status {
        ObjectStatus::Scheduled => brief.status = ScanStatus::Scheduled,
        ObjectStatus::Scanning => brief.status = ScanStatus::Scanning,
        ObjectStatus::None => {
            let Some(scanned_at) = info.last_scan_time else {
                brief.status = ScanStatus::Idle;
                return brief;
            };
            brief.scanned_at = Some(scanned_at);
            brief.result = Some(info.last_result);
            if info.last_result.is_none() {
                brief.status = ScanStatus::Finished;
                brief.high = info.high_vuls.len();
                brief.medium = info.med_vuls.len();
            } else if info.last_result.is_benign() {
                brief.status = ScanStatus::Finished;
            } else {
                brief.status = ScanStatus::Failed;
            }
        }
    }
    brief
}
