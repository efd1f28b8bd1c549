//! Flow trees used by the ingestion pipeline.

use super::payloads::{ScrapePayload, ScreenshotPayload, UpdateRecordPayload};
use super::records::RecordKind;
use crate::flow::FlowNode;

/// Scrape a document's URL, then write the content into the document.
pub fn document_flow(chatbot_id: &str, document_id: &str, url: &str) -> FlowNode {
    let scrape = FlowNode::new(
        format!("scrape-{}", document_id),
        &ScrapePayload {
            document_id: document_id.to_string(),
            url: url.to_string(),
        },
    );
    merge_flow(RecordKind::Document, chatbot_id, document_id, scrape)
}

/// Capture a product page, then store the screenshot location on the product.
pub fn product_screenshot_flow(chatbot_id: &str, product_id: &str, url: &str) -> FlowNode {
    let screenshot = FlowNode::new(
        format!("screenshot-{}", product_id),
        &ScreenshotPayload {
            product_id: product_id.to_string(),
            url: url.to_string(),
        },
    );
    merge_flow(RecordKind::Product, chatbot_id, product_id, screenshot)
}

fn merge_flow(kind: RecordKind, chatbot_id: &str, record_id: &str, child: FlowNode) -> FlowNode {
    FlowNode::new(
        format!("update-{}-from-{}", kind, child.name()),
        &UpdateRecordPayload {
            kind,
            record_id: record_id.to_string(),
            chatbot_id: chatbot_id.to_string(),
            child_key: child.key(),
        },
    )
    .with_child(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_addresses_child_by_key() {
        let flow = product_screenshot_flow("bot-1", "p1", "https://shop.example.com/p1");
        assert_eq!(flow.queue(), "update-record");
        assert_eq!(flow.name(), "update-product-from-screenshot-p1");
        assert_eq!(flow.key(), "update-record:update-product-from-screenshot-p1");
    }
}
